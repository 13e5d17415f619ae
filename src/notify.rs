/// Notification thread
///
/// Listener callbacks are queued here and delivered from one dedicated thread,
/// never from the capture or processing threads. A gate serialises delivery
/// against shutdown: once `shutdown` returns, no callback is running and none
/// will start.

use crate::listener::{HotwordListener, ListenerEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, error};

enum Message {
    Event(ListenerEvent),
    Shutdown,
}

struct Gate {
    closed: AtomicBool,
    delivering: Mutex<()>,
}

pub(crate) struct Notifier {
    tx: Sender<Message>,
    gate: Arc<Gate>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Notifier {
    pub(crate) fn spawn(listener: Arc<dyn HotwordListener>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let gate = Arc::new(Gate {
            closed: AtomicBool::new(false),
            delivering: Mutex::new(()),
        });

        let thread = {
            let gate = Arc::clone(&gate);
            std::thread::Builder::new()
                .name("hotword-notify".to_string())
                .spawn(move || run(rx, gate, listener))?
        };

        Ok(Self {
            tx,
            gate,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a callback; silently discarded after shutdown
    pub(crate) fn post(&self, event: ListenerEvent) {
        if self.gate.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("Notification thread gone, dropping {:?}", event);
        }
    }

    pub(crate) fn is_notification_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stop delivering. Waits for a callback in progress unless called from
    /// inside one; queued callbacks are discarded.
    pub(crate) fn shutdown(&self) {
        self.gate.closed.store(true, Ordering::SeqCst);

        if self.is_notification_thread() {
            // The running callback is the caller; the loop exits after it returns.
            let _ = self.tx.send(Message::Shutdown);
            return;
        }

        drop(self.gate.delivering.lock());
        let _ = self.tx.send(Message::Shutdown);

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Notification thread panicked");
            }
        }
    }
}

fn run(rx: Receiver<Message>, gate: Arc<Gate>, listener: Arc<dyn HotwordListener>) {
    for message in rx {
        let event = match message {
            Message::Event(event) => event,
            Message::Shutdown => break,
        };

        let _delivering = gate.delivering.lock();
        if gate.closed.load(Ordering::SeqCst) {
            break;
        }

        let listener = listener.as_ref();
        if catch_unwind(AssertUnwindSafe(|| event.deliver(listener))).is_err() {
            error!("Listener panicked while handling {:?}", event);
        }
    }
    debug!("Notification thread exiting");
}
