//! Bidirectional byte relay between two connected streams

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use tk_core::traits::BoxedStream;

/// Why a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The A -> B copy finished first (A reached EOF or failed)
    SourceA,
    /// The B -> A copy finished first (B reached EOF or failed)
    SourceB,
    /// The tunnel set was torn down
    Cancelled,
}

/// Pumps bytes between an accepted stream (A) and a dialed stream (B)
///
/// The session ends as soon as either direction finishes; the other
/// direction is stopped and both streams are shut down and dropped, once each.
pub struct RelaySession {
    label: String,
    a: BoxedStream,
    b: BoxedStream,
}

impl RelaySession {
    /// Pair two live streams
    pub fn new(label: impl Into<String>, a: BoxedStream, b: BoxedStream) -> Self {
        Self {
            label: label.into(),
            a,
            b,
        }
    }

    /// Relay until one side closes, errors, or `lost` fires
    pub async fn run(self, lost: CancellationToken) -> RelayEnd {
        let Self { label, a, b } = self;
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        let end = {
            let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
            let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);
            tokio::pin!(a_to_b, b_to_a);

            tokio::select! {
                result = &mut a_to_b => {
                    log_direction(&label, "->", &result);
                    RelayEnd::SourceA
                }
                result = &mut b_to_a => {
                    log_direction(&label, "<-", &result);
                    RelayEnd::SourceB
                }
                _ = lost.cancelled() => RelayEnd::Cancelled,
            }
        };

        // Both copies are dropped by now; close each end once
        let mut a = a_read.unsplit(a_write);
        let mut b = b_read.unsplit(b_write);
        let _ = a.shutdown().await;
        let _ = b.shutdown().await;
        drop(a);
        drop(b);

        tracing::debug!("Relay {} closed ({:?})", label, end);
        end
    }
}

fn log_direction(label: &str, arrow: &str, result: &std::io::Result<u64>) {
    match result {
        Ok(bytes) => tracing::debug!("Relay {} {} finished after {} bytes", label, arrow, bytes),
        Err(e) => tracing::debug!("Relay {} {} ended with error: {}", label, arrow, e),
    }
}
