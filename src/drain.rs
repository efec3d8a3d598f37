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

use tokio::sync::{mpsc, watch};

/// Constructs a new pair for draining.
/// * [DrainTrigger] can be used to start a draining sequence and wait for it to complete.
/// * [DrainWatcher] should be held by anything that wants to participate in the draining.
///   This can be cloned, and a drain will not complete until all outstanding DrainWatchers
///   are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (alive_tx, alive_rx) = mpsc::channel::<()>(1);
    (
        DrainTrigger {
            signal: signal_tx,
            drained: alive_rx,
        },
        DrainWatcher {
            signal: signal_rx,
            _alive: alive_tx,
        },
    )
}

#[derive(Debug)]
pub struct DrainTrigger {
    signal: watch::Sender<bool>,
    drained: mpsc::Receiver<()>,
}

impl DrainTrigger {
    /// Initiates a draining sequence. The future will not complete until the drain
    /// is complete (all outstanding [DrainWatcher]s and [DrainBlocker]s are dropped).
    pub async fn start_drain_and_wait(mut self) {
        let _ = self.signal.send(true);
        // recv yields None once every sender (watchers and blockers) is gone.
        while self.drained.recv().await.is_some() {}
    }
}

#[derive(Clone, Debug)]
pub struct DrainWatcher {
    signal: watch::Receiver<bool>,
    _alive: mpsc::Sender<()>,
}

impl DrainWatcher {
    /// Returns once a drain has been initiated. The drain will not complete
    /// until the returned [DrainBlocker] is dropped.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // An error means the trigger is gone, which counts as a drain.
        let _ = self.signal.wait_for(|drained| *drained).await;
        DrainBlocker(self._alive)
    }
}

/// DrainBlocker provides a token that must be dropped to unblock the drain.
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<()>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_watchers() {
        let (trigger, watcher) = new();
        let extra = watcher.clone();

        let task = tokio::spawn(async move {
            let blocker = watcher.wait_for_drain().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(blocker);
        });
        drop(extra);

        trigger.start_drain_and_wait().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_watcher_does_not_block() {
        let (trigger, watcher) = new();
        drop(watcher);
        trigger.start_drain_and_wait().await;
    }

    #[tokio::test]
    async fn blocker_holds_drain_open() {
        let (trigger, watcher) = new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _blocker = watcher.wait_for_drain().await;
            done_rx.await.unwrap();
        });

        let drained = trigger.start_drain_and_wait();
        tokio::pin!(drained);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut drained)
            .await
            .is_err());

        done_tx.send(()).unwrap();
        drained.await;
    }
}
