// Copyright 2025 The Kernelvisor Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use kernelvisor_error::Code;
use kernelvisor_util::init_tracing;

#[test]
fn init_tracing_only_once() {
    assert!(init_tracing().is_ok());
    let err = init_tracing().unwrap_err();
    assert_eq!(err.code, Code::Internal);
    assert_eq!(err.messages, vec!["Logging already initialized".to_string()]);
}
