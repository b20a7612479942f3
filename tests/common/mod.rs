//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use peer_transport::call::{IncomingRequest, RequestHandler};
use peer_transport::errors::{ChannelError, ErrorCode};
use peer_transport::net::frame::{CallContinuation, CallError, CallRequest, CallResponse, Init, TraceIds};
use peer_transport::net::tcp::FrameCodec;
use peer_transport::net::{Frame, FrameBody, SocketFactory, Transport};
use peer_transport::response::{ResponseBuilder, ResponseSink};

/// Transport that keeps every frame it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    remote_addr: Option<String>,
    frames: Mutex<Vec<Frame>>,
    destroyed: AtomicBool,
}

impl RecordingTransport {
    pub fn new(remote_addr: Option<&str>) -> Self {
        Self {
            remote_addr: remote_addr.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: Frame) -> io::Result<()> {
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
    transports: Mutex<Vec<(String, Arc<RecordingTransport>)>>,
}

impl RecordingFactory {
    pub fn connects(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<RecordingTransport> {
        self.transports.lock().unwrap()[index].1.clone()
    }
}

impl SocketFactory for RecordingFactory {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, ChannelError> {
        let addr = format!("{}:{}", host, port);
        let transport = Arc::new(RecordingTransport::new(Some(&addr)));
        self.transports.lock().unwrap().push((addr, transport.clone()));
        Ok(transport)
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

/// Answers every call with its own arg2 and arg3.
#[derive(Debug, Default)]
pub struct EchoHandler {
    pub calls: AtomicUsize,
}

impl RequestHandler for EchoHandler {
    fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        res.unstreamed().send_ok(req.arg2(), req.arg3()).unwrap();
    }
}

/// Counts requests and never answers them.
#[derive(Debug, Default)]
pub struct SilentHandler {
    pub calls: AtomicUsize,
}

impl RequestHandler for SilentHandler {
    fn handle_request(&self, _req: IncomingRequest, _res: ResponseBuilder) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails while `failing` is set, echoes otherwise.
#[derive(Debug)]
pub struct FlakyHandler {
    pub code: ErrorCode,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

impl RequestHandler for FlakyHandler {
    fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut stream = res.unstreamed();
        if self.failing.load(Ordering::SeqCst) {
            stream.send_error(self.code, "injected failure").unwrap();
        } else {
            stream.send_ok(req.arg2(), req.arg3()).unwrap();
        }
    }
}

pub fn init(host_port: &str) -> Init {
    Init {
        host_port: host_port.into(),
        process_name: "test".into(),
    }
}

/// Length-prefixed frame codec for tests.
///
/// ```text
/// size:u32 id:u32 kind:u8 body...
/// ```
#[derive(Debug, Default)]
pub struct TestCodec;

const INIT_REQUEST: u8 = 0x01;
const INIT_RESPONSE: u8 = 0x02;
const CALL_REQUEST: u8 = 0x03;
const CALL_RESPONSE: u8 = 0x04;
const CALL_REQUEST_CONT: u8 = 0x13;
const CALL_RESPONSE_CONT: u8 = 0x14;
const PING_REQUEST: u8 = 0xd0;
const PING_RESPONSE: u8 = 0xd1;
const CALL_ERROR: u8 = 0xff;

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

fn put_headers(dst: &mut BytesMut, headers: &BTreeMap<String, String>) {
    dst.put_u16(headers.len() as u16);
    for (key, value) in headers {
        put_str(dst, key);
        put_str(dst, value);
    }
}

fn put_args(dst: &mut BytesMut, args: &[Bytes]) {
    dst.put_u16(args.len() as u16);
    for arg in args {
        dst.put_u32(arg.len() as u32);
        dst.put_slice(arg);
    }
}

fn need(src: &Bytes, len: usize) -> io::Result<()> {
    if src.remaining() < len {
        return Err(invalid("truncated frame"));
    }
    Ok(())
}

fn get_str(src: &mut Bytes) -> io::Result<String> {
    need(src, 2)?;
    let len = src.get_u16() as usize;
    need(src, len)?;
    String::from_utf8(src.split_to(len).to_vec()).map_err(|_| invalid("bad utf8"))
}

fn get_headers(src: &mut Bytes) -> io::Result<BTreeMap<String, String>> {
    need(src, 2)?;
    let count = src.get_u16();
    let mut headers = BTreeMap::new();
    for _ in 0..count {
        let key = get_str(src)?;
        headers.insert(key, get_str(src)?);
    }
    Ok(headers)
}

fn get_args(src: &mut Bytes) -> io::Result<Vec<Bytes>> {
    need(src, 2)?;
    let count = src.get_u16();
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need(src, 4)?;
        let len = src.get_u32() as usize;
        need(src, len)?;
        args.push(src.split_to(len));
    }
    Ok(args)
}

fn get_u8(src: &mut Bytes) -> io::Result<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

impl FrameCodec for TestCodec {
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> io::Result<()> {
        let mut body = BytesMut::new();
        let kind = match &frame.body {
            FrameBody::InitRequest(init) | FrameBody::InitResponse(init) => {
                put_str(&mut body, &init.host_port);
                put_str(&mut body, &init.process_name);
                if matches!(frame.body, FrameBody::InitRequest(_)) {
                    INIT_REQUEST
                } else {
                    INIT_RESPONSE
                }
            }
            FrameBody::CallRequest(req) => {
                body.put_u8(req.is_last as u8);
                body.put_u64(req.ttl_ms);
                put_str(&mut body, &req.service);
                put_headers(&mut body, &req.headers);
                match &req.tracing {
                    Some(ids) => {
                        body.put_u8(1);
                        body.put_u64(ids.trace_id);
                        body.put_u64(ids.span_id);
                        body.put_u64(ids.parent_id.unwrap_or(0));
                    }
                    None => body.put_u8(0),
                }
                put_args(&mut body, &req.args);
                CALL_REQUEST
            }
            FrameBody::CallResponse(res) => {
                body.put_u8(res.is_last as u8);
                body.put_u8(res.code);
                put_headers(&mut body, &res.headers);
                put_args(&mut body, &res.args);
                CALL_RESPONSE
            }
            FrameBody::CallRequestContinuation(cont) | FrameBody::CallResponseContinuation(cont) => {
                body.put_u8(cont.is_last as u8);
                put_args(&mut body, &cont.args);
                if matches!(frame.body, FrameBody::CallRequestContinuation(_)) {
                    CALL_REQUEST_CONT
                } else {
                    CALL_RESPONSE_CONT
                }
            }
            FrameBody::CallError(err) => {
                put_str(&mut body, err.code.as_str());
                put_str(&mut body, &err.message);
                CALL_ERROR
            }
            FrameBody::PingRequest => PING_REQUEST,
            FrameBody::PingResponse => PING_RESPONSE,
        };
        dst.put_u32((body.len() + 5) as u32);
        dst.put_u32(frame.id);
        dst.put_u8(kind);
        dst.put_slice(&body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 5 {
            return Err(invalid("frame too short"));
        }
        if src.len() < 4 + size {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(size).freeze();
        let id = frame.get_u32();
        let kind = frame.get_u8();
        let body = match kind {
            INIT_REQUEST | INIT_RESPONSE => {
                let init = Init {
                    host_port: get_str(&mut frame)?,
                    process_name: get_str(&mut frame)?,
                };
                if kind == INIT_REQUEST {
                    FrameBody::InitRequest(init)
                } else {
                    FrameBody::InitResponse(init)
                }
            }
            CALL_REQUEST => {
                let is_last = get_u8(&mut frame)? == 1;
                need(&frame, 8)?;
                let ttl_ms = frame.get_u64();
                let service = get_str(&mut frame)?;
                let headers = get_headers(&mut frame)?;
                let tracing = if get_u8(&mut frame)? == 1 {
                    need(&frame, 24)?;
                    let trace_id = frame.get_u64();
                    let span_id = frame.get_u64();
                    let parent_id = Some(frame.get_u64()).filter(|id| *id != 0);
                    Some(TraceIds {
                        trace_id,
                        span_id,
                        parent_id,
                    })
                } else {
                    None
                };
                FrameBody::CallRequest(CallRequest {
                    is_last,
                    ttl_ms,
                    service,
                    headers,
                    tracing,
                    args: get_args(&mut frame)?,
                })
            }
            CALL_RESPONSE => FrameBody::CallResponse(CallResponse {
                is_last: get_u8(&mut frame)? == 1,
                code: get_u8(&mut frame)?,
                headers: get_headers(&mut frame)?,
                args: get_args(&mut frame)?,
            }),
            CALL_REQUEST_CONT | CALL_RESPONSE_CONT => {
                let cont = CallContinuation {
                    is_last: get_u8(&mut frame)? == 1,
                    args: get_args(&mut frame)?,
                };
                if kind == CALL_REQUEST_CONT {
                    FrameBody::CallRequestContinuation(cont)
                } else {
                    FrameBody::CallResponseContinuation(cont)
                }
            }
            CALL_ERROR => {
                let code = get_str(&mut frame)?;
                FrameBody::CallError(CallError {
                    code: ErrorCode::parse(&code).ok_or_else(|| invalid("unknown error code"))?,
                    message: get_str(&mut frame)?,
                })
            }
            PING_REQUEST => FrameBody::PingRequest,
            PING_RESPONSE => FrameBody::PingResponse,
            _ => return Err(invalid("unknown frame kind")),
        };
        Ok(Some(Frame::new(id, body)))
    }
}
