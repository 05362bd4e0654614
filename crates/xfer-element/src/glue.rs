//! `Glue`: the one element kind the linker inserts on its own, bridging two
//! neighbors whose mechanisms don't already match.
//!
//! Glue never speaks `DirectTcpListen`/`DirectTcpConnect`: a direct-TCP
//! source and destination share the same mechanism tag on purpose (see
//! [`crate::mechanism`]) and are wired straight to each other, so the
//! linker never needs to bridge them. Glue's table is the remaining five
//! combinations among `ReadFd`/`WriteFd`/`PullBuffer`/`PushBuffer`.

use std::sync::Mutex;
use std::thread;

use xfer_message::{Message, MessageSender};

use crate::element::{ElementArc, ElementCore, XferElement};
use crate::error::ElementError;
use crate::fd::{close_fd, read_fd, write_fd_all, NO_FD};
use crate::mechanism::{MechPair, Mechanism};

const BLOCK_SIZE: usize = 32 * 1024;

pub(crate) static MECH_PAIRS: &[MechPair] = &[
    MechPair::new(Mechanism::ReadFd, Mechanism::PushBuffer, 1, 1),
    MechPair::new(Mechanism::PullBuffer, Mechanism::WriteFd, 1, 1),
    MechPair::new(Mechanism::ReadFd, Mechanism::PullBuffer, 1, 0),
    MechPair::new(Mechanism::PushBuffer, Mechanism::WriteFd, 1, 0),
    MechPair::new(Mechanism::PullBuffer, Mechanism::PushBuffer, 0, 1),
    MechPair::new(Mechanism::ReadFd, Mechanism::WriteFd, 1, 1),
];

/// Bridges a `(input, output)` mechanism mismatch the linker found between
/// two adjacent elements.
#[derive(Debug)]
pub struct Glue {
    core: ElementCore,
    sender: Mutex<Option<MessageSender>>,
}

impl Glue {
    /// Creates glue for the given mechanism pairing.
    ///
    /// # Errors
    ///
    /// Returns [`ElementError::Configuration`] if `(input, output)` is not
    /// one of the combinations glue supports.
    pub fn new(input: Mechanism, output: Mechanism) -> Result<ElementArc, ElementError> {
        if !MECH_PAIRS
            .iter()
            .any(|pair| pair.input == input && pair.output == output)
        {
            return Err(ElementError::Configuration(format!(
                "glue has no bridge from {} to {}",
                input.name(),
                output.name()
            )));
        }
        let core = ElementCore::new("glue");
        core.set_mechs(input, output);
        core.set_can_generate_eof(true);
        Ok(std::sync::Arc::new(Self {
            core,
            sender: Mutex::new(None),
        }))
    }

    fn sender(&self) -> MessageSender {
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .expect("glue's sender is set before pull_buffer/push_buffer can be called")
    }

    fn post_done(&self) {
        self.sender().post(Message::done(self.core.handle()));
    }

    fn abrupt_stop(&self) -> bool {
        self.core.is_cancelled() && !self.core.expect_eof()
    }
}

impl XferElement for Glue {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        MECH_PAIRS
    }

    fn start(&self, me: ElementArc, sender: MessageSender) -> bool {
        *self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sender.clone());

        match self.core.mechs() {
            (Mechanism::ReadFd, Mechanism::PushBuffer) => {
                thread::spawn(move || {
                    let glue = downcast(&me);
                    let mut buf = vec![0u8; BLOCK_SIZE];
                    loop {
                        if glue.abrupt_stop() {
                            break;
                        }
                        let Some(upstream) = glue.core.upstream() else { break };
                        let fd = upstream.core().output_fd().get();
                        match read_fd(fd, &mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let Some(downstream) = glue.core.downstream() else { break };
                                downstream.push_buffer(Some(buf[..n].to_vec()));
                            }
                        }
                    }
                    if let Some(downstream) = glue.core.downstream() {
                        downstream.push_buffer(None);
                    }
                    glue.post_done();
                });
                true
            }
            (Mechanism::PullBuffer, Mechanism::WriteFd) => {
                thread::spawn(move || {
                    let glue = downcast(&me);
                    loop {
                        if glue.abrupt_stop() {
                            break;
                        }
                        let Some(upstream) = glue.core.upstream() else { break };
                        match upstream.pull_buffer() {
                            Some(data) => {
                                let Some(downstream) = glue.core.downstream() else { break };
                                if write_fd_all(downstream.core().input_fd().get(), &data).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    if let Some(downstream) = glue.core.downstream() {
                        close_fd(downstream.core().input_fd().take());
                    }
                    glue.post_done();
                });
                true
            }
            (Mechanism::PullBuffer, Mechanism::PushBuffer) => {
                thread::spawn(move || {
                    let glue = downcast(&me);
                    loop {
                        if glue.abrupt_stop() {
                            break;
                        }
                        let Some(upstream) = glue.core.upstream() else { break };
                        match upstream.pull_buffer() {
                            Some(data) => {
                                let Some(downstream) = glue.core.downstream() else { break };
                                downstream.push_buffer(Some(data));
                            }
                            None => break,
                        }
                    }
                    if let Some(downstream) = glue.core.downstream() {
                        downstream.push_buffer(None);
                    }
                    glue.post_done();
                });
                true
            }
            (Mechanism::ReadFd, Mechanism::WriteFd) => {
                thread::spawn(move || {
                    let glue = downcast(&me);
                    let mut buf = vec![0u8; BLOCK_SIZE];
                    loop {
                        if glue.abrupt_stop() {
                            break;
                        }
                        let Some(upstream) = glue.core.upstream() else { break };
                        let fd = upstream.core().output_fd().get();
                        match read_fd(fd, &mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let Some(downstream) = glue.core.downstream() else { break };
                                if write_fd_all(downstream.core().input_fd().get(), &buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    if let Some(downstream) = glue.core.downstream() {
                        close_fd(downstream.core().input_fd().take());
                    }
                    glue.post_done();
                });
                true
            }
            // ReadFd -> PullBuffer and PushBuffer -> WriteFd need no thread:
            // the downstream/upstream neighbor drives them directly through
            // pull_buffer/push_buffer, on demand.
            (Mechanism::ReadFd, Mechanism::PullBuffer) | (Mechanism::PushBuffer, Mechanism::WriteFd) => true,
            (input, output) => {
                unreachable!("glue started with unsupported mechanism pair {input:?} -> {output:?}")
            }
        }
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }

    fn pull_buffer(&self) -> Option<Vec<u8>> {
        debug_assert_eq!(self.core.mechs().0, Mechanism::ReadFd);
        let Some(upstream) = self.core.upstream() else {
            self.post_done();
            return None;
        };
        let fd = upstream.core().output_fd().get();
        if fd == NO_FD || self.abrupt_stop() {
            self.post_done();
            return None;
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        match read_fd(fd, &mut buf) {
            Ok(0) | Err(_) => {
                self.post_done();
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
        }
    }

    fn push_buffer(&self, data: Option<Vec<u8>>) {
        debug_assert_eq!(self.core.mechs().1, Mechanism::WriteFd);
        let Some(downstream) = self.core.downstream() else {
            return;
        };
        match data {
            Some(bytes) if !self.abrupt_stop() => {
                let _ = write_fd_all(downstream.core().input_fd().get(), &bytes);
            }
            _ => {
                close_fd(downstream.core().input_fd().take());
                self.post_done();
            }
        }
    }
}

fn downcast(me: &ElementArc) -> &Glue {
    let any: &dyn std::any::Any = me.as_ref();
    any.downcast_ref::<Glue>()
        .expect("xfer-element only ever spawns glue threads for Glue elements")
}
