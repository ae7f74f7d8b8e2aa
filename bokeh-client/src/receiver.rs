//! Reassembles messages from websocket fragments.

use crate::message::{Fragment, Message, ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Header,
    Metadata,
    Content,
    BufferHeader,
    BufferPayload,
}

/// Fragment-at-a-time state machine.
///
/// A fragment of the wrong kind is fatal: the receiver is left as it was
/// and the connection it reads from should be dropped.
#[derive(Debug)]
pub struct Receiver {
    state: ReceiverState,
    header: Option<String>,
    metadata: Option<String>,
    buf_header: Option<String>,
    partial: Option<Message>,
    message: Option<Message>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            state: ReceiverState::Header,
            header: None,
            metadata: None,
            buf_header: None,
            partial: None,
            message: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Feed one fragment. Returns the message it completes, if any.
    pub fn consume(&mut self, fragment: Fragment) -> Result<Option<Message>> {
        match self.state {
            ReceiverState::Header => {
                let text = expect_text(fragment)?;
                self.header = Some(text);
                self.metadata = None;
                self.buf_header = None;
                self.partial = None;
                self.message = None;
                self.state = ReceiverState::Metadata;
            }
            ReceiverState::Metadata => {
                self.metadata = Some(expect_text(fragment)?);
                self.state = ReceiverState::Content;
            }
            ReceiverState::Content => {
                let content = expect_text(fragment)?;
                let header = self.header.take().unwrap_or_default();
                let metadata = self.metadata.take().unwrap_or_default();
                let partial = Message::assemble(&header, &metadata, &content);
                self.state = ReceiverState::Header;
                self.partial = Some(partial?);
                return Ok(self.check_complete());
            }
            ReceiverState::BufferHeader => {
                self.buf_header = Some(expect_text(fragment)?);
                self.state = ReceiverState::BufferPayload;
            }
            ReceiverState::BufferPayload => {
                let payload = match fragment {
                    Fragment::Binary(data) => data,
                    Fragment::Text(_) => return Err(ProtocolError::ExpectedBinary),
                };
                let buf_header = self.buf_header.take().unwrap_or_default();
                if let Some(partial) = self.partial.as_mut() {
                    partial.assemble_buffer(&buf_header, payload)?;
                }
                return Ok(self.check_complete());
            }
        }
        Ok(None)
    }

    /// The most recently completed message.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    fn check_complete(&mut self) -> Option<Message> {
        match self.partial.take() {
            Some(partial) if partial.complete() => {
                self.state = ReceiverState::Header;
                self.message = Some(partial.clone());
                Some(partial)
            }
            Some(partial) => {
                self.state = ReceiverState::BufferHeader;
                self.partial = Some(partial);
                None
            }
            None => None,
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_text(fragment: Fragment) -> Result<String> {
    match fragment {
        Fragment::Text(text) => Ok(text),
        Fragment::Binary(_) => Err(ProtocolError::ExpectedText),
    }
}
