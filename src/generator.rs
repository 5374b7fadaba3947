//! Weighted random request source.
//!
//! Turns a validated load profile into an endless (or bounded) stream of
//! request builders. Each iteration draws an index proportional to the
//! entry's shares and pushes the matching builder onto a capacity-1
//! channel, so a saturated worker pool exerts backpressure on the
//! producer instead of letting it run ahead.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::builders::{
    ChurnRequestBuilder, GetRequestBuilder, ListRequestBuilder, PatchRequestBuilder,
    PodLogRequestBuilder, RequestBuilder, WatchListRequestBuilder,
};
use crate::config::{ConfigError, LoadProfileSpec, RequestKind};
use crate::scheduler::wait_cancelled;

/// Resource version marking an apiserver cache read.
const STALE_RESOURCE_VERSION: &str = "0";
/// Empty resource version forces a quorum (linearizable) read.
const QUORUM_RESOURCE_VERSION: &str = "";

/// Produces request builders picked proportionally to their shares.
pub struct WeightedRandomRequests {
    shares: Vec<u32>,
    builders: Vec<Arc<dyn RequestBuilder>>,
    tx: Option<mpsc::Sender<Arc<dyn RequestBuilder>>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl WeightedRandomRequests {
    /// Validates the spec and precomputes the aligned share and builder
    /// lists. Returns the source together with the consumer half of its
    /// builder channel.
    pub fn new(
        spec: &LoadProfileSpec,
    ) -> Result<(Self, mpsc::Receiver<Arc<dyn RequestBuilder>>), ConfigError> {
        spec.validate()?;

        let mut shares = Vec::with_capacity(spec.requests.len());
        let mut builders: Vec<Arc<dyn RequestBuilder>> = Vec::with_capacity(spec.requests.len());
        for entry in &spec.requests {
            shares.push(entry.shares);

            let retries = spec.max_retries;
            let builder: Arc<dyn RequestBuilder> =
                match entry.kind().map_err(ConfigError::Validation)? {
                    RequestKind::StaleList(s) => {
                        Arc::new(ListRequestBuilder::new(s, STALE_RESOURCE_VERSION, retries))
                    }
                    RequestKind::QuorumList(s) => {
                        Arc::new(ListRequestBuilder::new(s, QUORUM_RESOURCE_VERSION, retries))
                    }
                    RequestKind::WatchList(s) => Arc::new(WatchListRequestBuilder::new(s, retries)),
                    RequestKind::StaleGet(s) => {
                        Arc::new(GetRequestBuilder::new(s, STALE_RESOURCE_VERSION, retries))
                    }
                    RequestKind::QuorumGet(s) => {
                        Arc::new(GetRequestBuilder::new(s, QUORUM_RESOURCE_VERSION, retries))
                    }
                    RequestKind::GetPodLog(s) => Arc::new(PodLogRequestBuilder::new(s, retries)),
                    RequestKind::Patch(s) => Arc::new(PatchRequestBuilder::new(s, retries)),
                    RequestKind::PostDel(s) => Arc::new(
                        ChurnRequestBuilder::new(s, retries).map_err(ConfigError::Validation)?,
                    ),
                };
            builders.push(builder);
        }

        let (tx, rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok((
            Self {
                shares,
                builders,
                tx: Some(tx),
                cancel_tx,
                cancel_rx,
            },
            rx,
        ))
    }

    /// Drives the producer until `total` builders have been sent (when
    /// `total > 0`), [`WeightedRandomRequests::stop`] is called, or the
    /// caller's cancel signal fires.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>, total: usize) {
        let Some(tx) = self.tx.clone() else { return };
        let mut internal = self.cancel_rx.clone();

        let mut sent = 0usize;
        loop {
            if total > 0 && sent >= total {
                break;
            }
            let builder = self.random_pick();
            tokio::select! {
                sent_ok = tx.send(builder) => {
                    if sent_ok.is_err() {
                        break;
                    }
                    sent += 1;
                }
                _ = wait_cancelled(&mut internal) => break,
                _ = wait_cancelled(&mut cancel) => break,
            }
        }
        debug!(sent, "request producer finished");
    }

    /// Draws a uniform integer in `[0, sum of shares)` and walks the share
    /// list to find the winning builder.
    fn random_pick(&self) -> Arc<dyn RequestBuilder> {
        let sum: u64 = self.shares.iter().map(|&s| u64::from(s)).sum();
        let mut draw = rand::thread_rng().gen_range(0..sum);
        for (idx, &share) in self.shares.iter().enumerate() {
            let share = u64::from(share);
            if draw < share {
                return self.builders[idx].clone();
            }
            draw -= share;
        }
        unreachable!("weighted draw {} exceeded the share sum {}", draw, sum);
    }

    /// Stops the producer and closes the builder channel. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.cancel_tx.send(true);
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListSpec, RequestEntry};

    fn list_entry(shares: u32, resource: &str) -> RequestEntry {
        RequestEntry {
            shares,
            stale_list: Some(ListSpec {
                version: "v1".to_string(),
                resource: resource.to_string(),
                namespace: "default".to_string(),
                ..ListSpec::default()
            }),
            ..RequestEntry::default()
        }
    }

    fn spec_with(requests: Vec<RequestEntry>) -> LoadProfileSpec {
        LoadProfileSpec {
            rate: 0.0,
            total: 0,
            conns: 1,
            client: 0,
            content_type: Default::default(),
            disable_http2: false,
            max_retries: 0,
            requests,
        }
    }

    #[test]
    fn test_new_rejects_invalid_spec() {
        let spec = spec_with(vec![]);
        assert!(WeightedRandomRequests::new(&spec).is_err());
    }

    #[test]
    fn test_uniform_shares_converge() {
        let spec = spec_with(
            ["a", "b", "c", "d", "e"]
                .iter()
                .map(|r| list_entry(1, r))
                .collect(),
        );
        let (source, _rx) = WeightedRandomRequests::new(&spec).unwrap();

        const N: usize = 100_000;
        let mut counts = vec![0usize; source.builders.len()];
        for _ in 0..N {
            let picked = source.random_pick();
            let idx = source
                .builders
                .iter()
                .position(|b| Arc::ptr_eq(b, &picked))
                .expect("picked builder comes from the list");
            counts[idx] += 1;
        }

        let expected = N / counts.len();
        for (idx, &count) in counts.iter().enumerate() {
            let deviation = (count as f64 - expected as f64).abs() / expected as f64;
            assert!(
                deviation < 0.05,
                "bucket {} got {} picks, expected {} +/- 5%",
                idx,
                count,
                expected
            );
        }
    }

    #[test]
    fn test_weighted_shares_follow_ratio() {
        let spec = spec_with(vec![list_entry(3, "pods"), list_entry(1, "configmaps")]);
        let (source, _rx) = WeightedRandomRequests::new(&spec).unwrap();

        const N: usize = 40_000;
        let mut first = 0usize;
        for _ in 0..N {
            let picked = source.random_pick();
            if Arc::ptr_eq(&picked, &source.builders[0]) {
                first += 1;
            }
        }

        // Expect ~3/4 of picks in the first bucket.
        assert!(
            (28_500..=31_500).contains(&first),
            "first bucket got {} of {} picks",
            first,
            N
        );
    }

    #[tokio::test]
    async fn test_run_sends_exactly_total() {
        let spec = spec_with(vec![list_entry(1, "pods")]);
        let (mut source, mut rx) = WeightedRandomRequests::new(&spec).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let consumer = tokio::spawn(async move {
            let mut received = 0usize;
            while rx.recv().await.is_some() {
                received += 1;
            }
            received
        });

        source.run(cancel_rx, 25).await;
        source.stop();

        assert_eq!(consumer.await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_channel() {
        let spec = spec_with(vec![list_entry(1, "pods")]);
        let (mut source, mut rx) = WeightedRandomRequests::new(&spec).unwrap();

        source.stop();
        source.stop();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_caller_cancel_stops_unbounded_run() {
        let spec = spec_with(vec![list_entry(1, "pods")]);
        let (source, mut rx) = WeightedRandomRequests::new(&spec).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let consumer = tokio::spawn(async move {
            // Drain a few items, then cancel while the producer is blocked
            // on the full channel.
            for _ in 0..5 {
                rx.recv().await;
            }
            cancel_tx.send(true).unwrap();
            rx
        });

        // total == 0 runs until cancelled.
        source.run(cancel_rx, 0).await;
        drop(consumer.await.unwrap());
    }
}
