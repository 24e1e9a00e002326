//! WebSocket client used for the INFOS and MUXS connections.
//!
//! The connection runs over any non-blocking `Read + Write` link. Frames are
//! written through a bounded send buffer so callers can apply back-pressure,
//! and `DataSent` is reported each time the buffer drains completely.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use super::cred::CredSet;
use super::error::Error;
use super::s2e::MsgSink;

pub const WS_SENDBUF_SIZE:usize =   64 * 1024;
pub const WS_MAX_MSG:usize =        1 << 20;
const WS_MAX_HEADER:usize =         14;
const HTTP_MAX_HEADER:usize =       4096;

pub const OP_CONT:u8 =      0x0;
pub const OP_TEXT:u8 =      0x1;
pub const OP_BINARY:u8 =    0x2;
pub const OP_CLOSE:u8 =     0x8;
pub const OP_PING:u8 =      0x9;
pub const OP_PONG:u8 =      0xA;

pub const CLOSE_NORMAL:u16 =    1000;
pub const CLOSE_GOING_AWAY:u16 = 1001;
pub const CLOSE_PROTOCOL:u16 =  1002;
pub const CLOSE_NO_STATUS:u16 = 1005;


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUri {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl WsUri {
    /// Accepts `ws`, `wss`, `http` and `https` URIs. The port defaults to 80 or 443.
    pub fn parse(s: &str) -> Result<WsUri> {
        let s = s.trim();
        let (tls, rest) = if let Some(r) = s.strip_prefix("wss://") {
            (true, r)
        } else if let Some(r) = s.strip_prefix("https://") {
            (true, r)
        } else if let Some(r) = s.strip_prefix("ws://") {
            (false, r)
        } else if let Some(r) = s.strip_prefix("http://") {
            (false, r)
        } else {
            bail!("unsupported URI scheme: {}", s);
        };
        let (hostport, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = if let Some(h) = hostport.strip_prefix('[') {
            /* [v6addr]:port */
            let end = h.find(']').ok_or_else(|| anyhow!("bad IPv6 host in URI: {}", s))?;
            let port = match &h[end + 1..] {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| anyhow!("bad port in URI: {}", s))?),
            };
            (&h[..end], port)
        } else {
            match hostport.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (hostport, None),
            }
        };
        if host.is_empty() {
            bail!("missing host in URI: {}", s);
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|e| anyhow!("bad port in URI {}: {}", s, e))?,
            None if tls => 443,
            None => 80,
        };
        Ok(WsUri { tls, host: host.to_string(), port, path: path.to_string() })
    }

    /// Same server, `suffix` appended to the path.
    pub fn join(&self, suffix: &str) -> WsUri {
        let mut path = self.path.trim_end_matches('/').to_string();
        if !suffix.starts_with('/') {
            path.push('/');
        }
        path.push_str(suffix);
        WsUri { path, ..self.clone() }
    }
}

impl fmt::Display for WsUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}{}", scheme, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
        }
    }
}


/// Byte stream under a websocket. Reads and writes must not block.
pub trait Link: Read + Write {}

impl<T: Read + Write> Link for T {}

/// Opens links to servers. TLS capable connectors are provided by the embedding binary.
pub trait Connector {
    fn open(&mut self, uri: &WsUri, creds: CredSet) -> Result<Box<dyn Link>>;
}

/// Plain TCP, `ws://` only.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&mut self, uri: &WsUri, creds: CredSet) -> Result<Box<dyn Link>> {
        if uri.tls {
            bail!("{}: TLS needs an external connector", uri);
        }
        debug!("Connecting to {} ({:?} credentials)", uri, creds);
        let s = TcpStream::connect((uri.host.as_str(), uri.port))?;
        s.set_nodelay(true)?;
        s.set_nonblocking(true)?;
        Ok(Box::new(s))
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Connected,
    Text(String),
    Binary(Vec<u8>),
    DataSent,
    Closed(u16),
    Dead(String),
}

const WS_GUID:&str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value a server must answer to `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

/* value of the first header line named `name` in an HTTP head */
fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|l| {
        let (k, v) = l.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Encodes one frame with FIN set. Client frames carry a mask, server frames do not.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let n = payload.len();
    let mut out = Vec::with_capacity(n + WS_MAX_HEADER);
    out.push(0x80 | (opcode & 0x0F));
    let mbit = if mask.is_some() { 0x80 } else { 0 };
    if n < 126 {
        out.push(mbit | n as u8);
    } else if n <= u16::MAX as usize {
        out.push(mbit | 126);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(mbit | 127);
        out.extend_from_slice(&(n as u64).to_be_bytes());
    }
    match mask {
        Some(m) => {
            out.extend_from_slice(&m);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ m[i & 3]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Decodes the frame at the start of `buf`. `Ok(None)` if more bytes are needed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(Error::Ws("reserved bits set".into()));
    }
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let (len, mut off) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(b), 10)
        }
        n => (n as u64, 2),
    };
    if len > WS_MAX_MSG as u64 {
        return Err(Error::Ws(format!("frame too large ({} bytes)", len)));
    }
    if opcode >= OP_CLOSE && (len > 125 || !fin) {
        return Err(Error::Ws("bad control frame".into()));
    }
    let mask = if masked {
        if buf.len() < off + 4 {
            return Ok(None);
        }
        let m = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
        off += 4;
        Some(m)
    } else {
        None
    };
    let len = len as usize;
    if buf.len() < off + len {
        return Ok(None);
    }
    let mut payload = buf[off..off + len].to_vec();
    if let Some(m) = mask {
        payload.iter_mut().enumerate().for_each(|(i, b)| *b ^= m[i & 3]);
    }
    Ok(Some((Frame { fin, opcode, payload }, off + len)))
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    Upgrading,
    Open,
    Closing,
    Closed,
}

pub struct WsConn {
    link: Box<dyn Link>,
    state: WsState,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    wlimit: usize,
    pending: bool,
    frag: Option<(u8, Vec<u8>)>,
    accept: String,
}

impl WsConn {
    /// Starts the HTTP upgrade on `link`. Progress is made by `poll`.
    pub fn connect(link: Box<dyn Link>, uri: &WsUri) -> Self {
        let key = base64::encode(rand::random::<[u8; 16]>());
        let req = format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            uri.path, uri.host, uri.port, key
        );
        debug!("WS upgrade {}", uri);
        Self {
            link,
            state: WsState::Upgrading,
            rbuf: Vec::new(),
            wbuf: req.into_bytes(),
            wlimit: WS_SENDBUF_SIZE,
            pending: false,
            frag: None,
            accept: accept_key(&key),
        }
    }

    pub fn with_sendbuf(mut self, size: usize) -> Self {
        self.wlimit = size.max(WS_MAX_HEADER + 1);
        self
    }

    pub fn is_open(&self) -> bool {
        self.state == WsState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == WsState::Closed
    }

    /// Bytes waiting to be written to the link.
    pub fn unsent(&self) -> usize {
        self.wbuf.len()
    }

    fn queue(&mut self, opcode: u8, payload: &[u8]) -> bool {
        let frame = encode_frame(opcode, payload, Some(rand::random::<[u8; 4]>()));
        if opcode < OP_CLOSE && self.wbuf.len() + frame.len() > self.wlimit {
            return false;
        }
        self.wbuf.extend_from_slice(&frame);
        self.pending = true;
        true
    }

    /// Starts an orderly close with `code`.
    pub fn close(&mut self, code: u16) {
        if self.state != WsState::Open {
            self.state = WsState::Closed;
            return;
        }
        self.queue(OP_CLOSE, &code.to_be_bytes());
        self.state = WsState::Closing;
        let _ = self.flush_out();
    }

    fn flush_out(&mut self) -> io::Result<()> {
        while !self.wbuf.is_empty() {
            match self.link.write(&self.wbuf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "link closed")),
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.link.flush().or_else(|e| if e.kind() == io::ErrorKind::WouldBlock { Ok(()) } else { Err(e) })
    }

    fn fill_in(&mut self) -> io::Result<bool> {
        let mut tmp = [0u8; 4096];
        loop {
            match self.link.read(&mut tmp) {
                Ok(0) => return Ok(false),
                Ok(n) => self.rbuf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn die(&mut self, ev: &mut Vec<WsEvent>, why: String) {
        warn!("WS connection dead: {}", why);
        self.state = WsState::Closed;
        ev.push(WsEvent::Dead(why));
    }

    /// Moves bytes in both directions and reports what happened.
    pub fn poll(&mut self, ev: &mut Vec<WsEvent>) {
        if self.state == WsState::Closed {
            return;
        }
        if let Err(e) = self.flush_out() {
            self.die(ev, format!("write failed: {}", e));
            return;
        }
        if self.pending && self.wbuf.is_empty() && self.state == WsState::Open {
            self.pending = false;
            ev.push(WsEvent::DataSent);
        }
        let alive = match self.fill_in() {
            Ok(a) => a,
            Err(e) => {
                self.die(ev, format!("read failed: {}", e));
                return;
            }
        };

        if self.state == WsState::Upgrading {
            let end = match self.rbuf.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(i) => i + 4,
                None if self.rbuf.len() > HTTP_MAX_HEADER => {
                    self.die(ev, "oversized upgrade response".into());
                    return;
                }
                None => {
                    if !alive {
                        self.die(ev, "connection closed during upgrade".into());
                    }
                    return;
                }
            };
            let head = String::from_utf8_lossy(&self.rbuf[..end]).to_string();
            let status = head.lines().next().unwrap_or("").to_string();
            if status.split_whitespace().nth(1) != Some("101") {
                self.die(ev, format!("upgrade rejected: {}", status));
                return;
            }
            if header(&head, "Sec-WebSocket-Accept") != Some(self.accept.as_str()) {
                self.die(ev, "upgrade response without matching Sec-WebSocket-Accept".into());
                return;
            }
            self.rbuf.drain(..end);
            self.state = WsState::Open;
            self.pending = false;
            ev.push(WsEvent::Connected);
        }

        loop {
            if self.state == WsState::Closed {
                return;
            }
            let (frame, used) = match decode_frame(&self.rbuf) {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    self.queue(OP_CLOSE, &CLOSE_PROTOCOL.to_be_bytes());
                    let _ = self.flush_out();
                    self.die(ev, e.to_string());
                    return;
                }
            };
            self.rbuf.drain(..used);
            if let Err(e) = self.on_frame(frame, ev) {
                self.die(ev, e.to_string());
                return;
            }
        }
        if !alive && self.state != WsState::Closed {
            self.die(ev, "connection closed by peer".into());
        }
    }

    fn on_frame(&mut self, f: Frame, ev: &mut Vec<WsEvent>) -> Result<(), Error> {
        trace!(opcode = f.opcode, len = f.payload.len(), fin = f.fin, "WS frame");
        match f.opcode {
            OP_TEXT | OP_BINARY => {
                if self.frag.is_some() {
                    return Err(Error::Ws("new message inside fragmented one".into()));
                }
                if f.fin {
                    ev.push(deliver(f.opcode, f.payload)?);
                } else {
                    self.frag = Some((f.opcode, f.payload));
                }
            }
            OP_CONT => {
                let (op, mut buf) = self.frag.take().ok_or_else(|| Error::Ws("stray continuation frame".into()))?;
                buf.extend_from_slice(&f.payload);
                if buf.len() > WS_MAX_MSG {
                    return Err(Error::Ws("message too large".into()));
                }
                if f.fin {
                    ev.push(deliver(op, buf)?);
                } else {
                    self.frag = Some((op, buf));
                }
            }
            OP_PING => {
                self.queue(OP_PONG, &f.payload);
            }
            OP_PONG => {}
            OP_CLOSE => {
                let code = match f.payload.as_slice() {
                    [a, b, ..] => u16::from_be_bytes([*a, *b]),
                    _ => CLOSE_NO_STATUS,
                };
                if self.state == WsState::Open {
                    self.queue(OP_CLOSE, &code.to_be_bytes());
                    let _ = self.flush_out();
                }
                debug!("WS closed with code {}", code);
                self.state = WsState::Closed;
                ev.push(WsEvent::Closed(code));
            }
            op => return Err(Error::Ws(format!("unknown opcode {}", op))),
        }
        Ok(())
    }
}

fn deliver(opcode: u8, payload: Vec<u8>) -> Result<WsEvent, Error> {
    if opcode == OP_TEXT {
        String::from_utf8(payload)
            .map(WsEvent::Text)
            .map_err(|_| Error::Ws("text message is not UTF-8".into()))
    } else {
        Ok(WsEvent::Binary(payload))
    }
}

impl MsgSink for WsConn {
    fn has_sendbuf(&self, minsize: usize) -> bool {
        self.state == WsState::Open && self.wbuf.len() + minsize + WS_MAX_HEADER <= self.wlimit
    }

    fn send_text(&mut self, text: &str) -> bool {
        self.state == WsState::Open && self.queue(OP_TEXT, text.as_bytes())
    }

    fn send_binary(&mut self, data: &[u8]) -> bool {
        self.state == WsState::Open && self.queue(OP_BINARY, data)
    }
}


#[derive(Debug, Default)]
struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex link. Reads report `WouldBlock` while no data is queued.
#[derive(Debug, Clone)]
pub struct MemLink {
    rx: Rc<RefCell<Pipe>>,
    tx: Rc<RefCell<Pipe>>,
    stalled: Rc<RefCell<bool>>,
}

impl MemLink {
    pub fn pair() -> (MemLink, MemLink) {
        let a: Rc<RefCell<Pipe>> = Rc::default();
        let b: Rc<RefCell<Pipe>> = Rc::default();
        (
            MemLink { rx: a.clone(), tx: b.clone(), stalled: Rc::default() },
            MemLink { rx: b, tx: a, stalled: Rc::default() },
        )
    }

    /// Closes both directions; the peer reads EOF once drained.
    pub fn close(&self) {
        self.rx.borrow_mut().closed = true;
        self.tx.borrow_mut().closed = true;
    }

    /// While stalled, writes from this end report `WouldBlock`.
    pub fn stall(&self, on: bool) {
        *self.stalled.borrow_mut() = on;
    }

    pub fn available(&self) -> usize {
        self.rx.borrow().buf.len()
    }

    /// Drains everything queued for this end.
    pub fn drain(&self) -> Vec<u8> {
        self.rx.borrow_mut().buf.drain(..).collect()
    }
}

impl Read for MemLink {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut p = self.rx.borrow_mut();
        if p.buf.is_empty() {
            return if p.closed { Ok(0) } else { Err(io::ErrorKind::WouldBlock.into()) };
        }
        let n = out.len().min(p.buf.len());
        for (o, b) in out.iter_mut().zip(p.buf.drain(..n)) {
            *o = b;
        }
        Ok(n)
    }
}

impl Write for MemLink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if *self.stalled.borrow() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut p = self.tx.borrow_mut();
        if p.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        p.buf.extend(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemConnState {
    pub refuse: bool,
    pub opened: Vec<(WsUri, CredSet, MemLink)>,
}

/// Connector over `MemLink` pairs. The server ends of opened links stay accessible through the shared state.
#[derive(Debug, Clone, Default)]
pub struct MemConnector {
    pub state: Rc<RefCell<MemConnState>>,
}

impl Connector for MemConnector {
    fn open(&mut self, uri: &WsUri, creds: CredSet) -> Result<Box<dyn Link>> {
        let mut st = self.state.borrow_mut();
        if st.refuse {
            bail!("{}: connection refused", uri);
        }
        let (client, server) = MemLink::pair();
        st.opened.push((uri.clone(), creds, server));
        Ok(Box::new(client))
    }
}

/// Server side helper: answers a pending upgrade request on `link`.
pub fn accept_upgrade(link: &mut MemLink) -> bool {
    let req = String::from_utf8_lossy(&link.drain()).to_string();
    let key = match header(&req, "Sec-WebSocket-Key") {
        Some(k) if req.starts_with("GET ") => k.to_string(),
        _ => return false,
    };
    let resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    link.write_all(resp.as_bytes()).is_ok()
}

/// Server side helper: decodes all complete frames queued on `link`.
pub fn read_frames(link: &MemLink) -> Vec<Frame> {
    let buf = link.drain();
    let mut out = Vec::new();
    let mut off = 0;
    while let Ok(Some((f, n))) = decode_frame(&buf[off..]) {
        out.push(f);
        off += n;
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    fn open_pair() -> (WsConn, MemLink) {
        let (c, mut s) = MemLink::pair();
        let uri = WsUri::parse("ws://lns.example:6090/router").unwrap();
        let mut ws = WsConn::connect(Box::new(c), &uri);
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert!(accept_upgrade(&mut s));
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::Connected]);
        (ws, s)
    }

    #[test]
    fn uri_forms() {
        let u = WsUri::parse("wss://tc.example.com/path/x").unwrap();
        assert_eq!((u.tls, u.host.as_str(), u.port, u.path.as_str()), (true, "tc.example.com", 443, "/path/x"));
        let u = WsUri::parse("http://10.0.0.1:8080").unwrap();
        assert_eq!((u.tls, u.port, u.path.as_str()), (false, 8080, "/"));
        let u = WsUri::parse("ws://[::1]:6038/").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.to_string(), "ws://[::1]:6038/");
        assert_eq!(u.join("router-info").path, "/router-info");
        assert!(WsUri::parse("ftp://x").is_err());
        assert!(WsUri::parse("ws://:80/").is_err());
        assert!(WsUri::parse("ws://h:99999/").is_err());
    }

    #[test]
    fn frame_lengths() {
        for n in [0usize, 125, 126, 65535, 65536] {
            let p = vec![0x5A; n];
            let enc = encode_frame(OP_BINARY, &p, Some([1, 2, 3, 4]));
            let (f, used) = decode_frame(&enc).unwrap().unwrap();
            assert_eq!(used, enc.len());
            assert_eq!(f.payload, p);
            assert!(decode_frame(&enc[..enc.len() - 1]).unwrap().is_none());
        }
        assert!(decode_frame(&[0x89, 126, 0, 200]).is_err());
    }

    #[test]
    fn upgrade_request_and_rejection() {
        let (c, s) = MemLink::pair();
        let uri = WsUri::parse("ws://h/router-info").unwrap();
        let mut ws = WsConn::connect(Box::new(c), &uri);
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        let req = String::from_utf8(s.drain()).unwrap();
        assert!(req.starts_with("GET /router-info HTTP/1.1\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: "));
        let mut s2 = s.clone();
        s2.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap();
        ws.poll(&mut ev);
        assert!(matches!(&ev[..], [WsEvent::Dead(m)] if m.contains("403")));
    }

    #[test]
    fn accept_key_derivation() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let head = "HTTP/1.1 101 Switching Protocols\r\nsec-websocket-accept:  abc \r\n\r\n";
        assert_eq!(header(head, "Sec-WebSocket-Accept"), Some("abc"));
        assert_eq!(header(head, "Upgrade"), None);
    }

    #[test]
    fn upgrade_with_wrong_accept_rejected() {
        for resp in [
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n",
            "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        ] {
            let (c, mut s) = MemLink::pair();
            let uri = WsUri::parse("ws://h/router").unwrap();
            let mut ws = WsConn::connect(Box::new(c), &uri);
            let mut ev = Vec::new();
            ws.poll(&mut ev);
            let _ = s.drain();
            s.write_all(resp.as_bytes()).unwrap();
            ws.poll(&mut ev);
            assert!(matches!(&ev[..], [WsEvent::Dead(m)] if m.contains("Sec-WebSocket-Accept")));
            assert!(ws.is_closed());
        }
    }

    #[test]
    fn messages_both_ways() {
        let (mut ws, mut s) = open_pair();
        assert!(ws.send_text("{\"msgtype\":\"version\"}"));
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::DataSent]);
        let frames = read_frames(&s);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OP_TEXT);
        assert_eq!(frames[0].payload, b"{\"msgtype\":\"version\"}");

        s.write_all(&encode_frame(OP_TEXT, b"hello", None)).unwrap();
        s.write_all(&encode_frame(OP_BINARY, &[1, 2], None)).unwrap();
        ev.clear();
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::Text("hello".into()), WsEvent::Binary(vec![1, 2])]);
    }

    #[test]
    fn fragments_reassembled_and_ping_answered() {
        let (mut ws, mut s) = open_pair();
        let mut first = encode_frame(OP_TEXT, b"ab", None);
        first[0] &= 0x7F;
        s.write_all(&first).unwrap();
        s.write_all(&encode_frame(OP_PING, b"p", None)).unwrap();
        s.write_all(&encode_frame(OP_CONT, b"cd", None)).unwrap();
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::Text("abcd".into())]);
        ws.poll(&mut ev);
        let frames = read_frames(&s);
        assert_eq!(frames[0].opcode, OP_PONG);
        assert_eq!(frames[0].payload, b"p");
    }

    #[test]
    fn send_buffer_bounded() {
        let (ws, _srv) = open_pair();
        let mut ws = ws.with_sendbuf(100);
        assert!(ws.has_sendbuf(50));
        assert!(!ws.has_sendbuf(90));
        assert!(ws.send_text(&"x".repeat(60)));
        assert!(!ws.has_sendbuf(30));
        assert!(!ws.send_text(&"y".repeat(30)));
    }

    #[test]
    fn stalled_link_delays_datasent() {
        let (c, mut srv) = MemLink::pair();
        let ctl = c.clone();
        let mut ws = WsConn::connect(Box::new(c), &WsUri::parse("ws://h/").unwrap());
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert!(accept_upgrade(&mut srv));
        ws.poll(&mut ev);
        ev.clear();
        ctl.stall(true);
        assert!(ws.send_text("up"));
        ws.poll(&mut ev);
        assert!(ev.is_empty());
        assert!(ws.unsent() > 0);
        ctl.stall(false);
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::DataSent]);
    }

    #[test]
    fn close_handshake() {
        let (mut ws, mut s) = open_pair();
        s.write_all(&encode_frame(OP_CLOSE, &4000u16.to_be_bytes(), None)).unwrap();
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert_eq!(ev, vec![WsEvent::Closed(4000)]);
        assert!(ws.is_closed());
        let frames = read_frames(&s);
        assert_eq!(frames[0].opcode, OP_CLOSE);
        assert_eq!(frames[0].payload, 4000u16.to_be_bytes());
    }

    #[test]
    fn peer_eof_is_dead() {
        let (mut ws, s) = open_pair();
        s.close();
        let mut ev = Vec::new();
        ws.poll(&mut ev);
        assert!(matches!(&ev[..], [WsEvent::Dead(_)]));
    }
}
