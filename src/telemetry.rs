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

use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, EnvFilter};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Installs the global tracing subscriber. Output format is selected with
/// `LOG_FORMAT` (plain or json), filtering with `RUST_LOG`.
///
/// The returned guard must be held for the lifetime of the process; dropping it
/// flushes and stops the non-blocking writer.
pub fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
    Lazy::force(&APPLICATION_START_TIME);
    let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());

    let filter = default_filter();
    if env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string()) == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(filter),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_filter(filter),
            )
            .init();
    }
    guard
}

fn default_filter() -> EnvFilter {
    // The hickory serve loop logs every malformed packet at warn; keep it quiet
    // unless explicitly requested.
    let var = env::var(EnvFilter::DEFAULT_ENV)
        .map(|v| format!("hickory_server::server::server_future=off,{v}"))
        .unwrap_or_else(|_| "hickory_server::server::server_future=off,info".to_string());
    EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .parse_lossy(var)
}
