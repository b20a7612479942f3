//! Framing state machine of one outbound response.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::clock::Clock;
use crate::errors::{ChannelError, ErrorCode};
use crate::net::frame::{CallContinuation, CallError, CallResponse, Frame, FrameBody};
use crate::observability::{Span, Tracer};
use crate::response::argstream::OutArgStream;
use crate::response::{Finish, Outcome, ResponseObserver, ResponseOptions, ResponseSink, ResponseState};

pub struct ResponseStream {
    id: u32,
    state: ResponseState,
    streamed: bool,
    ok: bool,
    code: u8,
    headers: BTreeMap<String, String>,
    args: OutArgStream,
    start_ms: Option<u64>,
    finished: bool,
    sink: Arc<dyn ResponseSink>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn ResponseObserver>>,
    span: Option<Span>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("streamed", &self.streamed)
            .field("ok", &self.ok)
            .finish()
    }
}

impl ResponseStream {
    pub(crate) fn new(
        id: u32,
        options: ResponseOptions,
        sink: Arc<dyn ResponseSink>,
        clock: Arc<dyn Clock>,
        observers: Vec<Arc<dyn ResponseObserver>>,
        span: Option<Span>,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> Self {
        let mut args = OutArgStream::new();
        if options.streamed {
            // arg1 of a response is always empty
            args.end(0);
        }
        Self {
            id,
            state: ResponseState::Initial,
            streamed: options.streamed,
            ok: true,
            code: 0,
            headers: options.headers,
            args,
            start_ms: None,
            finished: false,
            sink,
            clock,
            observers,
            span,
            tracer,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Send the first frame. Only legal from `Initial`.
    pub fn send_call_response_frame(&mut self, args: Vec<Bytes>, is_last: bool) -> Result<(), ChannelError> {
        match self.state {
            ResponseState::Initial => {
                let now = self.clock.now_ms();
                self.start_ms = Some(now);
                if let Some(span) = &mut self.span {
                    span.annotate("ss", now);
                }
                self.state = if is_last {
                    ResponseState::Done
                } else {
                    ResponseState::Streaming
                };
                self.sink.send_response_frame(Frame::new(
                    self.id,
                    FrameBody::CallResponse(CallResponse {
                        is_last,
                        code: self.code,
                        headers: self.headers.clone(),
                        args,
                    }),
                ));
                if is_last {
                    self.finish(self.done_outcome());
                }
                Ok(())
            }
            ResponseState::Streaming => self.fail(ChannelError::ResponseFrameState {
                attempted: "call response".into(),
                state: self.state.to_string(),
            }),
            ResponseState::Done | ResponseState::Error => self.fail(ChannelError::ResponseAlreadyDone {
                attempted: "call response".into(),
            }),
        }
    }

    /// Send a continuation. Only legal while `Streaming`.
    pub fn send_call_response_cont_frame(&mut self, args: Vec<Bytes>, is_last: bool) -> Result<(), ChannelError> {
        match self.state {
            ResponseState::Streaming => {
                if is_last {
                    self.state = ResponseState::Done;
                }
                self.sink.send_response_frame(Frame::new(
                    self.id,
                    FrameBody::CallResponseContinuation(CallContinuation { is_last, args }),
                ));
                if is_last {
                    self.finish(self.done_outcome());
                }
                Ok(())
            }
            ResponseState::Initial => self.fail(ChannelError::ResponseFrameState {
                attempted: "call response continuation".into(),
                state: self.state.to_string(),
            }),
            ResponseState::Done | ResponseState::Error => self.fail(ChannelError::ResponseAlreadyDone {
                attempted: "call response continuation".into(),
            }),
        }
    }

    /// Answer with an error frame, closing any open args.
    pub fn send_error(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), ChannelError> {
        let message = message.into();
        if self.state.is_terminal() {
            return self.fail(ChannelError::ResponseAlreadyDone {
                attempted: format!("send error frame: {}: {}", code, message),
            });
        }
        let now = self.clock.now_ms();
        if let Some(span) = &mut self.span {
            span.annotate("ss", now);
        }
        self.state = ResponseState::Error;
        self.args.finish_all();
        self.sink.send_response_frame(Frame::new(
            self.id,
            FrameBody::CallError(CallError {
                code,
                message: message.clone(),
            }),
        ));
        self.finish(Outcome::Error { code, message });
        Ok(())
    }

    /// Mark the response as an application success or failure.
    pub fn set_ok(&mut self, ok: bool) -> Result<(), ChannelError> {
        if self.state != ResponseState::Initial {
            return self.fail(ChannelError::ResponseAlreadyStarted {
                state: self.state.to_string(),
            });
        }
        self.ok = ok;
        self.code = if ok { 0 } else { 1 };
        Ok(())
    }

    pub fn send_ok(&mut self, res1: impl Into<Bytes>, res2: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.set_ok(true)?;
        self.send(res1, res2)
    }

    /// Application-level failure. Ignored once an error frame went out.
    pub fn send_not_ok(&mut self, res1: impl Into<Bytes>, res2: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.state == ResponseState::Error {
            tracing::error!(id = self.id, "Cannot send application error, already sent error frame");
            return Ok(());
        }
        self.set_ok(false)?;
        self.send(res1, res2)
    }

    /// Send head and body. Unstreamed responses go out as one frame.
    pub fn send(&mut self, res1: impl Into<Bytes>, res2: impl Into<Bytes>) -> Result<(), ChannelError> {
        let (res1, res2) = (res1.into(), res2.into());
        if !self.streamed {
            return self.send_call_response_frame(vec![Bytes::new(), res1, res2], true);
        }
        self.write_arg2(&res1)?;
        self.args.end(1);
        self.write_arg3(&res2)?;
        self.args.end(2);
        self.flush()
    }

    pub fn write_arg2(&mut self, chunk: &[u8]) -> Result<(), ChannelError> {
        self.write_arg(1, chunk)
    }

    pub fn write_arg3(&mut self, chunk: &[u8]) -> Result<(), ChannelError> {
        self.write_arg(2, chunk)
    }

    pub fn end_arg2(&mut self) {
        self.args.end(1);
    }

    /// Ending arg3 completes the response on the next flush.
    pub fn end_arg3(&mut self) {
        self.args.end(2);
    }

    fn write_arg(&mut self, index: usize, chunk: &[u8]) -> Result<(), ChannelError> {
        if self.state.is_terminal() {
            return self.fail(ChannelError::ResponseAlreadyDone {
                attempted: format!("write arg{}", index + 1),
            });
        }
        match self.args.write(index, chunk) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    /// Emit whatever the arg streams accumulated as one frame.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        let Some((parts, is_last)) = self.args.take_frame() else {
            return Ok(());
        };
        match self.state {
            ResponseState::Initial => self.send_call_response_frame(parts, is_last),
            ResponseState::Streaming => self.send_call_response_cont_frame(parts, is_last),
            ResponseState::Done => self.fail(ChannelError::ResponseFrameState {
                attempted: "arg parts".into(),
                state: self.state.to_string(),
            }),
            ResponseState::Error => {
                tracing::warn!(id = self.id, "Dropping arg parts after error frame");
                Ok(())
            }
        }
    }

    fn done_outcome(&self) -> Outcome {
        if self.ok {
            Outcome::Ok
        } else {
            Outcome::NotOk
        }
    }

    fn fail<T>(&self, err: ChannelError) -> Result<T, ChannelError> {
        tracing::debug!(id = self.id, state = %self.state, error = %err, "Response misuse");
        for observer in &self.observers {
            observer.on_response_error(&err);
        }
        Err(err)
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        let end_ms = self.clock.now_ms();
        if let (Some(tracer), Some(span)) = (&self.tracer, &self.span) {
            tracer.report(span.clone());
        }
        let finish = Finish {
            id: self.id,
            start_ms: self.start_ms,
            end_ms,
            outcome,
            span: self.span.clone(),
        };
        for observer in &self.observers {
            observer.on_response_finish(&finish);
        }
    }
}
