//! Background processing loop
//!
//! One dedicated thread runs the blocking read-decode-dispatch cycle for the
//! lifetime of a session. Cancellation is cooperative: the flag is checked
//! at the top of each iteration and the session's eventfd unblocks any
//! in-progress read.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::inotify::{Canceller, Session};
use crate::translate::{Flow, Translator};
use crate::tree::WatchTree;

pub(crate) fn run(
    mut session: Session,
    tree: Arc<Mutex<WatchTree>>,
    mut translator: Translator,
    cancel: Arc<Canceller>,
    recursive: bool,
) {
    debug!("watch loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let record = match session.next_event() {
            Ok(Some(record)) => record,
            // End of stream: cancellation closed the read
            Ok(None) => break,
            Err(err) => {
                warn!("unrecoverable read error: {}", err);
                translator.emit_error(err);
                break;
            }
        };

        match translator.process(&mut session, &tree, &record) {
            Flow::Continue => {}
            Flow::Overflow => {
                // An unknown number of events was lost. Under recursive
                // watching the mirrored tree can no longer be trusted and is
                // rebuilt from a fresh scan; a flat watch set just continues.
                if recursive {
                    let result = tree.lock().rebuild(&session);
                    if let Err(err) = result {
                        translator.emit_error(err);
                    }
                }
            }
            Flow::RootGone => break,
        }

        // Never leave a moved-from dangling across a blocking read
        if !session.has_buffered_data() {
            translator.flush_pending(&session, &tree);
        }
    }

    // Deregister every watch before the loop exits
    tree.lock().teardown(&session);
    debug!("watch loop stopped");
}
