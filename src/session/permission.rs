//! Single-flight microphone permission prompt.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::hardware::{AudioHardware, RecordPermission};

/// Shares one in-flight system prompt between every concurrent caller.
///
/// The prompt runs in its own task, so a caller that abandons its request does
/// not cancel the prompt for the others.
#[derive(Default)]
pub(crate) struct PermissionGate {
    pending: Mutex<Option<watch::Receiver<Option<bool>>>>,
}

impl PermissionGate {
    pub(crate) async fn request(&self, hardware: &Arc<dyn AudioHardware>) -> bool {
        match hardware.record_permission() {
            RecordPermission::Granted => return true,
            RecordPermission::Denied => return false,
            RecordPermission::Undetermined => {}
        }

        let mut answer = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *pending = Some(rx.clone());
                    let hardware = hardware.clone();
                    tokio::spawn(async move {
                        log::info!("Requesting microphone permission");
                        let granted = hardware.request_record_permission().await;
                        log::info!("Microphone permission answered: granted={}", granted);
                        let _ = tx.send(Some(granted));
                    });
                    rx
                }
            }
        };

        let granted = match answer.wait_for(Option::is_some).await {
            Ok(value) => (*value).unwrap_or(false),
            Err(_) => {
                log::error!("Permission prompt task ended without an answer");
                false
            }
        };

        // The platform now remembers the answer; later calls return early.
        let mut pending = self.pending.lock();
        if pending
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_some() || rx.has_changed().is_err())
        {
            *pending = None;
        }

        granted
    }
}
