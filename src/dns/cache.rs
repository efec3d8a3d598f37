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

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, Name, Record, RecordType};
use tokio::sync::watch;

/// Hard ceiling on the TTL of any record this server hands out. The OS
/// resolver must not cache cluster addresses across pod reschedules.
pub const MAX_TTL: u32 = 30;

const NEGATIVE_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct QueryKey {
    pub name: Name,
    pub rtype: RecordType,
    pub class: DNSClass,
}

/// A lookup outcome: the records (possibly none) plus the response code and
/// authority flag that belong in the reply. `Clone`, so every query coalesced
/// onto one in-flight lookup can receive the same result.
#[derive(Clone, Debug)]
pub struct CachedAnswer {
    pub records: Vec<Record>,
    pub authoritative: bool,
    pub response_code: ResponseCode,
}

impl CachedAnswer {
    /// A record-less reply carrying only a response code.
    pub fn error(response_code: ResponseCode) -> Self {
        Self {
            records: Vec::new(),
            authoritative: false,
            response_code,
        }
    }

    pub fn servfail() -> Self {
        Self::error(ResponseCode::ServFail)
    }
}

enum Slot {
    InFlight(watch::Receiver<Option<CachedAnswer>>),
    Ready {
        answer: CachedAnswer,
        expires: Instant,
    },
}

/// Short-TTL answer cache with single-flight coalescing: at most one
/// underlying cluster/upstream call is outstanding per key at any time.
pub struct DnsCache {
    slots: Mutex<HashMap<QueryKey, Slot>>,
    positive_cap: Duration,
    negative_ttl: Duration,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttls(Duration::from_secs(MAX_TTL as u64), NEGATIVE_TTL)
    }

    pub fn with_ttls(positive_cap: Duration, negative_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            positive_cap,
            negative_ttl,
        }
    }

    /// Returns the cached answer for `key`, attaching to an in-flight lookup
    /// when one exists, or performing `lookup` otherwise.
    pub async fn get_or_lookup<F, Fut>(&self, key: QueryKey, lookup: F) -> CachedAnswer
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedAnswer>,
    {
        enum Role {
            Lead(watch::Sender<Option<CachedAnswer>>),
            Wait(watch::Receiver<Option<CachedAnswer>>),
        }

        let role = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(&key) {
                Some(Slot::Ready { answer, expires }) if *expires > Instant::now() => {
                    return answer.clone();
                }
                // has_changed errs when the leader was dropped mid-lookup;
                // the slot is stale and we take the lead instead.
                Some(Slot::InFlight(rx)) if rx.has_changed().is_ok() => Role::Wait(rx.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), Slot::InFlight(rx));
                    Role::Lead(tx)
                }
            }
        };

        match role {
            Role::Wait(mut rx) => {
                let result = rx.wait_for(|slot| slot.is_some()).await.map(|a| a.clone());
                match result {
                    Ok(answer) => answer.expect("waited for Some"),
                    // The leader vanished without publishing; treat like any
                    // other transient failure.
                    Err(_) => {
                        let last = rx.borrow().clone();
                        last.unwrap_or_else(CachedAnswer::servfail)
                    }
                }
            }
            Role::Lead(tx) => {
                let answer = lookup().await;
                let mut slots = self.slots.lock().unwrap();
                match self.expiry_for(&answer) {
                    Some(expires) => {
                        slots.insert(
                            key,
                            Slot::Ready {
                                answer: answer.clone(),
                                expires,
                            },
                        );
                    }
                    None => {
                        slots.remove(&key);
                    }
                }
                let _ = tx.send(Some(answer.clone()));
                answer
            }
        }
    }

    fn expiry_for(&self, answer: &CachedAnswer) -> Option<Instant> {
        let ttl = match answer.response_code {
            ResponseCode::NoError if !answer.records.is_empty() => {
                let record_ttl = answer
                    .records
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(MAX_TTL);
                self.positive_cap
                    .min(Duration::from_secs(record_ttl as u64))
            }
            // Empty answers and NXDOMAIN are negative results with a shorter life.
            ResponseCode::NoError | ResponseCode::NXDomain => self.negative_ttl,
            // Transient failures are never cached.
            _ => return None,
        };
        Some(Instant::now() + ttl)
    }
}

/// Clamps every record's TTL to [MAX_TTL].
pub fn clamp_ttls(mut records: Vec<Record>) -> Vec<Record> {
    for record in &mut records {
        if record.ttl() > MAX_TTL {
            record.set_ttl(MAX_TTL);
        }
    }
    records
}
