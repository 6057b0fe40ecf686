//! The bridge task.
//!
//! One long-lived task per lifecycle. It installs the case context once and
//! then executes queued work items one at a time, in order, until it sees the
//! stop marker. Phase failures are handed to their callers; a process-fatal
//! signal ends the task by resuming the panic, which the controller surfaces
//! to the synchronous caller.

use std::time::{Duration, Instant};

use core_async::sync::oneshot;
use core_runtime::BridgeConfig;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::context::CaseContext;
use crate::queue::{Completion, Message, QueueConsumer};

#[derive(Debug, Clone, Copy)]
pub(crate) struct BridgeSettings {
    pub debug: bool,
    pub slow_phase_threshold: Duration,
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            debug: config.debug,
            slow_phase_threshold: config.slow_phase_threshold,
        }
    }
}

pub(crate) async fn run(
    mut consumer: QueueConsumer,
    ready: oneshot::Sender<()>,
    context: CaseContext,
    settings: BridgeSettings,
) {
    let body = async move {
        let _ = ready.send(());
        debug!("bridge task ready");

        while let Some(message) = consumer.next().await {
            let item = match message {
                Message::Work(item) => item,
                Message::Stop => {
                    debug!("stop marker received");
                    return;
                }
            };

            let seq = item.seq();
            let started = Instant::now();
            let completion = item.execute().await;
            let elapsed = started.elapsed();

            if settings.debug {
                trace!(seq, ?elapsed, "work item finished");
                if elapsed > settings.slow_phase_threshold {
                    warn!(
                        seq,
                        ?elapsed,
                        threshold = ?settings.slow_phase_threshold,
                        "work item exceeded slow phase threshold"
                    );
                }
            }

            match completion {
                Completion::Delivered { failed: true } => {
                    debug!(seq, "work item failed; failure handed to caller");
                }
                Completion::Delivered { failed: false } => {}
                Completion::Discarded { failed } => {
                    debug!(seq, failed, "caller abandoned work item; outcome discarded");
                }
                Completion::Fatal(payload) => {
                    warn!(seq, "fatal signal in work item; bridge task terminating");
                    std::panic::resume_unwind(payload);
                }
            }
        }

        debug!("rendezvous queue closed; bridge task exiting");
    };

    context
        .scope(body)
        .instrument(info_span!("bridge_task"))
        .await
}
