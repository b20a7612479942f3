//! Shared fakes for unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::call::{IncomingRequest, RequestHandler};
use crate::channel::ChannelContext;
use crate::clock::{ManualClock, RandomSource};
use crate::errors::ChannelError;
use crate::net::{Frame, SocketFactory, Transport};
use crate::observability::stats::RecordingStatSink;
use crate::response::{ResponseBuilder, ResponseSink};

/// Transport that keeps every frame it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    remote_addr: Option<String>,
    frames: Mutex<Vec<Frame>>,
    destroyed: AtomicBool,
    broken: bool,
}

impl RecordingTransport {
    pub fn new(remote_addr: Option<&str>) -> Self {
        Self {
            remote_addr: remote_addr.map(str::to_string),
            ..Default::default()
        }
    }

    /// Every send fails.
    pub fn broken(remote_addr: Option<&str>) -> Self {
        Self {
            broken: true,
            ..Self::new(remote_addr)
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: Frame) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Socket factory handing out recording transports.
#[derive(Debug, Default)]
pub struct RecordingFactory {
    connects: Mutex<Vec<(String, u16)>>,
    broken: bool,
}

impl RecordingFactory {
    /// Hands out transports whose writes all fail.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    pub fn connects(&self) -> Vec<(String, u16)> {
        self.connects.lock().unwrap().clone()
    }
}

impl SocketFactory for RecordingFactory {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, ChannelError> {
        self.connects.lock().unwrap().push((host.to_string(), port));
        let addr = format!("{}:{}", host, port);
        if self.broken {
            return Ok(Arc::new(RecordingTransport::broken(Some(&addr))));
        }
        Ok(Arc::new(RecordingTransport::new(Some(&addr))))
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl ResponseSink for RecordingSink {
    fn send_response_frame(&self, frame: Frame) {
        self.frames.lock().unwrap().push(frame);
    }
}

/// Records requests and never answers them.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    requests: Mutex<Vec<IncomingRequest>>,
}

impl RecordingHandler {
    pub fn requests(&self) -> Vec<IncomingRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RequestHandler for RecordingHandler {
    fn handle_request(&self, req: IncomingRequest, _res: ResponseBuilder) {
        self.requests.lock().unwrap().push(req);
    }
}

/// Answers every call with its own arg2 and arg3.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder) {
        res.unstreamed().send_ok(req.arg2(), req.arg3()).unwrap();
    }
}

pub fn context(name: &str) -> Arc<ChannelContext> {
    Arc::new(ChannelContext::new(name, Arc::new(RecordingHandler::default())))
}

pub fn context_with_handler(name: &str, handler: Arc<dyn RequestHandler>) -> Arc<ChannelContext> {
    Arc::new(ChannelContext::new(name, handler))
}

pub fn context_with_stats(name: &str, stats: RecordingStatSink) -> Arc<ChannelContext> {
    Arc::new(ChannelContext::new(name, Arc::new(RecordingHandler::default())).with_stats(Arc::new(stats)))
}

pub fn context_with_clock(name: &str, clock: Arc<ManualClock>) -> Arc<ChannelContext> {
    Arc::new(ChannelContext::new(name, Arc::new(RecordingHandler::default())).with_clock(clock))
}

pub fn context_with_random(name: &str, random: Arc<dyn RandomSource>) -> Arc<ChannelContext> {
    Arc::new(ChannelContext::new(name, Arc::new(RecordingHandler::default())).with_random(random))
}
