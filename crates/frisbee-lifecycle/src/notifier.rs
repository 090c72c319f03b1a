//! Phase notifications for a fixed set of children
//!
//! A [`Notifier`] is created for the children a parent is about to own. Watch
//! handlers feed it every observed state of those children through
//! [`Notifier::handle`], in any order and from any task. Each child signals
//! Running and Success at most once, so duplicated or replayed watch events
//! never double count.
//!
//! Consumers either block on a single phase with [`Notifier::expect`] or
//! follow the parent through its phases with [`Notifier::update`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use frisbee_common::crd::{Lifecycle, Phase};
use frisbee_common::Error;

use crate::status::ChildRef;
use crate::{LifecycleError, Result};

/// Reasons written by [`Notifier::update`]
pub mod reasons {
    pub const ALL_CHILDREN_RUNNING: &str = "AllChildrenRunning";
    pub const CHILD_IN_CHAOS: &str = "ChildInChaos";
    pub const ALL_CHILDREN_COMPLETE: &str = "AllChildrenComplete";
    pub const CHILD_FAILED: &str = "ChildFailed";
    pub const INVALID_STATE_TRANSITION: &str = "InvalidStateTransition";
}

/// Persists the lifecycle of the parent the notifier reports for
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, lifecycle: Lifecycle) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Slot {
    #[default]
    Waiting,
    Signaled,
}

impl Slot {
    /// Returns true if this call did the signaling
    fn signal(&mut self) -> bool {
        let first = *self == Slot::Waiting;
        *self = Slot::Signaled;
        first
    }
}

#[derive(Debug, Default)]
struct ChildSlots {
    running: Slot,
    success: Slot,
    chaos: Slot,
}

#[derive(Debug)]
struct Tracked {
    children: HashMap<String, ChildSlots>,
    running_left: usize,
    success_left: usize,
}

struct Receivers {
    running: watch::Receiver<bool>,
    complete: watch::Receiver<bool>,
    failed: mpsc::UnboundedReceiver<String>,
    chaos: mpsc::UnboundedReceiver<String>,
    running_seen: bool,
    complete_seen: bool,
}

/// Signal-once tracker of a fixed set of children
pub struct Notifier {
    tracked: Mutex<Tracked>,
    parent_running: watch::Sender<bool>,
    parent_complete: watch::Sender<bool>,
    failed: mpsc::UnboundedSender<String>,
    chaos: mpsc::UnboundedSender<String>,
    receivers: tokio::sync::Mutex<Receivers>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("tracked", &*self.tracked.lock())
            .finish_non_exhaustive()
    }
}

async fn raised(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|v| *v).await.is_ok()
}

impl Notifier {
    /// Track the children named `names`.
    ///
    /// # Errors
    ///
    /// An invariant error if `names` is empty or contains an empty name.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::invariant("notifier", "no children to track").into());
        }

        let mut children = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(Error::invariant("notifier", "child with empty name").into());
            }
            children.insert(name.to_string(), ChildSlots::default());
        }

        let total = children.len();
        let (running_tx, running_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(false);
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let (chaos_tx, chaos_rx) = mpsc::unbounded_channel();

        Ok(Self {
            tracked: Mutex::new(Tracked {
                children,
                running_left: total,
                success_left: total,
            }),
            parent_running: running_tx,
            parent_complete: complete_tx,
            failed: failed_tx,
            chaos: chaos_tx,
            receivers: tokio::sync::Mutex::new(Receivers {
                running: running_rx,
                complete: complete_rx,
                failed: failed_rx,
                chaos: chaos_rx,
                running_seen: false,
                complete_seen: false,
            }),
        })
    }

    /// Whether `name` is one of the tracked children
    pub fn tracks(&self, name: &str) -> bool {
        self.tracked.lock().children.contains_key(name)
    }

    /// Record an observed state of a tracked child.
    ///
    /// # Errors
    ///
    /// An invariant error if the child has no name or is not tracked.
    pub fn handle(&self, child: &ChildRef) -> Result<()> {
        if child.name.is_empty() {
            let msg = format!("{} without a name", child.kind);
            return Err(Error::invariant("notifier", msg).into());
        }

        let mut tracked = self.tracked.lock();
        let Tracked {
            children,
            running_left,
            success_left,
        } = &mut *tracked;

        let slots = children.get_mut(&child.name).ok_or_else(|| {
            Error::invariant(
                "notifier",
                format!("{}/{} is not tracked", child.kind, child.name),
            )
        })?;

        match child.phase() {
            Phase::Uninitialized | Phase::Pending => {}
            Phase::Running => {
                if slots.running.signal() {
                    *running_left -= 1;
                    debug!(child = %child.name, left = *running_left, "child is running");
                    if *running_left == 0 {
                        self.parent_running.send_replace(true);
                    }
                }
            }
            Phase::Success => {
                if slots.success.signal() {
                    *success_left -= 1;
                    debug!(child = %child.name, left = *success_left, "child is complete");
                    if *success_left == 0 {
                        self.parent_complete.send_replace(true);
                    }
                }
            }
            Phase::Failed => {
                // the receiver lives as long as self
                let _ = self.failed.send(child.lifecycle.to_string());
            }
            Phase::Chaos => {
                if slots.chaos.signal() {
                    let _ = self.chaos.send(format!("{}/{} is in chaos", child.kind, child.name));
                }
            }
        }
        Ok(())
    }

    /// Next aggregate phase in priority order: running, complete, failed,
    /// chaos. Each aggregate is reported once.
    async fn next_phase(
        rx: &mut Receivers,
        cancel: &CancellationToken,
    ) -> Result<(Phase, String)> {
        let Receivers {
            running,
            complete,
            failed,
            chaos,
            running_seen,
            complete_seen,
        } = rx;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(Error::cancelled("notifier").into()),
            true = raised(running), if !*running_seen => {
                *running_seen = true;
                Ok((Phase::Running, String::new()))
            }
            true = raised(complete), if !*complete_seen => {
                *complete_seen = true;
                Ok((Phase::Success, String::new()))
            }
            Some(msg) = failed.recv() => Ok((Phase::Failed, msg)),
            Some(msg) = chaos.recv() => Ok((Phase::Chaos, msg)),
        }
    }

    /// Wait until the children settle in `expected`.
    ///
    /// # Errors
    ///
    /// - invariant error when waiting for Uninitialized, Pending or Chaos
    /// - [`LifecycleError::UnexpectedPhase`] if the children reach another
    ///   final phase
    /// - [`LifecycleError::InvalidTransition`] if they leave Chaos for
    ///   anything but Success
    /// - cancelled error if `cancel` fires first
    pub async fn expect(&self, cancel: &CancellationToken, expected: Phase) -> Result<()> {
        if expected.is(&[Phase::Uninitialized, Phase::Pending, Phase::Chaos]) {
            return Err(Error::invariant(
                "notifier",
                format!("cannot wait for phase {expected}"),
            )
            .into());
        }

        let mut rx = self.receivers.lock().await;
        let (mut phase, mut message) = Self::next_phase(&mut rx, cancel).await?;

        loop {
            if phase == expected {
                return Ok(());
            }

            match phase {
                Phase::Success | Phase::Failed => {
                    return Err(LifecycleError::UnexpectedPhase {
                        expected,
                        got: phase,
                        message,
                    });
                }
                Phase::Running => {
                    (phase, message) = Self::next_phase(&mut rx, cancel).await?;
                }
                Phase::Chaos => {
                    let (next, next_message) = Self::next_phase(&mut rx, cancel).await?;
                    if next.is(&[Phase::Running, Phase::Failed]) {
                        return Err(LifecycleError::InvalidTransition {
                            from: Phase::Chaos,
                            to: next,
                        });
                    }
                    (phase, message) = (next, next_message);
                }
                Phase::Uninitialized | Phase::Pending => {
                    return Err(Error::invariant(
                        "notifier",
                        format!("aggregate phase {phase} is never reported"),
                    )
                    .into());
                }
            }
        }
    }

    /// Follow the children and persist every aggregate phase through
    /// `writer`, until a final phase is written or `cancel` fires.
    pub fn update(
        self: &Arc<Self>,
        cancel: CancellationToken,
        writer: Arc<dyn StatusWriter>,
    ) -> JoinHandle<Result<()>> {
        let notifier = Arc::clone(self);

        tokio::spawn(async move {
            let mut rx = notifier.receivers.lock().await;
            let mut previous: Option<Phase> = None;

            loop {
                let (phase, message) = Self::next_phase(&mut rx, &cancel).await?;

                let mut lifecycle = Lifecycle::default();
                match (previous, phase) {
                    (Some(Phase::Chaos), Phase::Running | Phase::Failed) => {
                        let err = LifecycleError::InvalidTransition {
                            from: Phase::Chaos,
                            to: phase,
                        };
                        warn!(error = %err, "children left chaos");
                        lifecycle.transition(
                            Phase::Failed,
                            reasons::INVALID_STATE_TRANSITION,
                            err.to_string(),
                        );
                    }
                    (_, Phase::Running) => lifecycle.transition(
                        Phase::Running,
                        reasons::ALL_CHILDREN_RUNNING,
                        "all children are running",
                    ),
                    (_, Phase::Chaos) => lifecycle.transition(
                        Phase::Chaos,
                        reasons::CHILD_IN_CHAOS,
                        "at least one of the children is experiencing chaos",
                    ),
                    (_, Phase::Success) => lifecycle.transition(
                        Phase::Success,
                        reasons::ALL_CHILDREN_COMPLETE,
                        "all children are complete",
                    ),
                    (_, Phase::Failed) => {
                        lifecycle.transition(Phase::Failed, reasons::CHILD_FAILED, message)
                    }
                    (_, Phase::Uninitialized | Phase::Pending) => continue,
                }

                let written = lifecycle.phase;
                info!(phase = %written, reason = %lifecycle.reason, "updating parent");
                writer.write(lifecycle).await?;

                if written.is_terminal() {
                    return Ok(());
                }
                previous = Some(phase);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::child;
    use std::time::Duration;

    fn notifier(names: &[&str]) -> Notifier {
        Notifier::new(names).unwrap()
    }

    #[test]
    fn empty_or_unknown_children_are_rejected() {
        assert!(Notifier::new::<&str>(&[]).unwrap_err().is_invariant());
        assert!(Notifier::new(&[""]).unwrap_err().is_invariant());

        let n = notifier(&["a"]);
        assert!(n.handle(&child("b", Phase::Running)).unwrap_err().is_invariant());
        assert!(n.handle(&child("", Phase::Running)).unwrap_err().is_invariant());
        assert!(n.handle(&child("a", Phase::Pending)).is_ok());
    }

    /// Story: watch events are replayed after a relist. A child reported
    /// Running twice must not stand in for a sibling that never ran.
    #[tokio::test]
    async fn signals_are_close_once() {
        let n = notifier(&["a", "b"]);
        n.handle(&child("a", Phase::Running)).unwrap();
        n.handle(&child("a", Phase::Running)).unwrap();

        let cancel = CancellationToken::new();
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            n.expect(&cancel, Phase::Running),
        )
        .await;
        assert!(pending.is_err(), "one running child is not enough");

        n.handle(&child("b", Phase::Running)).unwrap();
        n.expect(&cancel, Phase::Running).await.unwrap();
    }

    #[tokio::test]
    async fn expect_success_passes_through_running() {
        let n = notifier(&["a"]);
        n.handle(&child("a", Phase::Running)).unwrap();
        n.handle(&child("a", Phase::Success)).unwrap();

        n.expect(&CancellationToken::new(), Phase::Success)
            .await
            .unwrap();
    }

    /// Story: a child crashes before its siblings are all up. Waiting for
    /// Running reports the failure instead of hanging.
    #[tokio::test]
    async fn expect_running_reports_an_early_failure() {
        let n = notifier(&["a", "b"]);
        n.handle(&child("a", Phase::Running)).unwrap();
        n.handle(&child("b", Phase::Failed)).unwrap();

        let err = n
            .expect(&CancellationToken::new(), Phase::Running)
            .await
            .unwrap_err();
        match err {
            LifecycleError::UnexpectedPhase { expected, got, .. } => {
                assert_eq!(expected, Phase::Running);
                assert_eq!(got, Phase::Failed);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expect_running_then_failed() {
        let n = notifier(&["a", "b"]);
        n.handle(&child("a", Phase::Running)).unwrap();
        n.handle(&child("b", Phase::Running)).unwrap();

        let cancel = CancellationToken::new();
        n.expect(&cancel, Phase::Running).await.unwrap();

        n.handle(&child("b", Phase::Failed)).unwrap();
        let err = n.expect(&cancel, Phase::Success).await.unwrap_err();
        match err {
            LifecycleError::UnexpectedPhase { expected, got, message } => {
                assert_eq!(expected, Phase::Success);
                assert_eq!(got, Phase::Failed);
                assert!(message.starts_with("phase:Failed reason:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn chaos_may_only_resolve_to_success() {
        let n = notifier(&["a"]);
        n.handle(&child("a", Phase::Chaos)).unwrap();

        let cancel = CancellationToken::new();
        let (result, _) = tokio::join!(n.expect(&cancel, Phase::Success), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            n.handle(&child("a", Phase::Failed)).unwrap();
        });

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: Phase::Chaos,
                to: Phase::Failed
            }
        ));
    }

    #[tokio::test]
    async fn non_final_phases_cannot_be_expected() {
        let n = notifier(&["a"]);
        let cancel = CancellationToken::new();
        for phase in [Phase::Uninitialized, Phase::Pending, Phase::Chaos] {
            assert!(n.expect(&cancel, phase).await.unwrap_err().is_invariant());
        }
    }

    #[tokio::test]
    async fn cancellation_is_an_error() {
        let n = notifier(&["a"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(n
            .expect(&cancel, Phase::Running)
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn update_writes_each_phase_until_final() {
        let n = Arc::new(notifier(&["a"]));
        let written = Arc::new(Mutex::new(Vec::new()));

        let sink = written.clone();
        let mut writer = MockStatusWriter::new();
        writer.expect_write().times(2).returning(move |lf| {
            sink.lock().push((lf.phase, lf.message));
            Ok(())
        });

        n.handle(&child("a", Phase::Running)).unwrap();
        n.handle(&child("a", Phase::Success)).unwrap();

        n.update(CancellationToken::new(), Arc::new(writer))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            *written.lock(),
            vec![
                (Phase::Running, "all children are running".to_string()),
                (Phase::Success, "all children are complete".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn update_fails_the_parent_when_chaos_turns_to_failure() {
        let n = Arc::new(notifier(&["a"]));
        let written = Arc::new(Mutex::new(Vec::new()));

        let sink = written.clone();
        let mut writer = MockStatusWriter::new();
        writer.expect_write().times(2).returning(move |lf| {
            sink.lock().push((lf.phase, lf.reason));
            Ok(())
        });

        n.handle(&child("a", Phase::Chaos)).unwrap();
        let task = n.update(CancellationToken::new(), Arc::new(writer));

        tokio::time::sleep(Duration::from_millis(20)).await;
        n.handle(&child("a", Phase::Failed)).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(
            *written.lock(),
            vec![
                (Phase::Chaos, reasons::CHILD_IN_CHAOS.to_string()),
                (Phase::Failed, reasons::INVALID_STATE_TRANSITION.to_string()),
            ]
        );
    }
}
