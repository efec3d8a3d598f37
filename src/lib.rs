// Copyright Podlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod app;
pub mod config;
pub mod dns;
pub mod drain;
pub mod metrics;
pub mod osdns;
pub mod podaccess;
pub mod routing;
pub mod signal;
pub mod socket;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;
