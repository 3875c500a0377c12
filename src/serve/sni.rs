/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Reads only the TLS ClientHello from a new connection and extracts the
//! `server_name` extension (RFC 6066) without terminating TLS.
//!
//! `g3_dpi::parser::tls::ClientHello` has no available source in the
//! retrieval pack, so the parser below is hand-written directly against
//! the TLS 1.2/1.3 record and handshake framing (RFC 8446 §4, RFC 6066
//! §3), buffering the same way `sni_proxy`'s accept task buffers
//! `clt_r_buf`: grow the buffer and retry the parse on `NeedMoreData`
//! rather than tracking a cursor across calls.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::timeout;

use super::io::{AnyStream, Stream};

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Only the failure modes that matter to the caller: either the record
/// isn't fully buffered yet (ask for more bytes), or what's buffered is
/// not a well-formed ClientHello carrying an SNI `host_name`.
enum ParseOutcome {
    NeedMoreData,
    Malformed(&'static str),
    Hostname(String),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        let end = self.pos.checked_add(n).ok_or("length overflow")?;
        let slice = self.buf.get(self.pos..end).ok_or("truncated field")?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, &'static str> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, &'static str> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn parse_server_name_extension(data: &[u8]) -> Result<Option<String>, &'static str> {
    let mut c = Cursor::new(data);
    let list_len = c.u16()? as usize;
    if list_len > c.remaining() {
        return Err("truncated server_name_list");
    }
    let list_end = c.pos + list_len;
    while c.pos < list_end {
        let name_type = c.u8()?;
        let name_len = c.u16()? as usize;
        let name = c.take(name_len)?;
        if name_type == SERVER_NAME_TYPE_HOST_NAME {
            let hostname = std::str::from_utf8(name)
                .map_err(|_| "server name is not valid utf-8")?
                .to_string();
            return Ok(Some(hostname));
        }
    }
    Ok(None)
}

/// Attempts to parse a complete ClientHello out of `buf`. `buf` holds
/// exactly one TLS record's framing (content type + version + length)
/// followed by as much of the handshake body as has been read so far;
/// fragmentation of the ClientHello across multiple TLS records is not
/// supported (uncommon in practice — most clients fit it in one record).
fn try_parse(buf: &[u8]) -> ParseOutcome {
    if buf.len() < 5 {
        return ParseOutcome::NeedMoreData;
    }
    if buf[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return ParseOutcome::Malformed("first byte is not a TLS handshake record");
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return ParseOutcome::NeedMoreData;
    }

    let mut c = Cursor::new(&buf[5..5 + record_len]);
    let hs_type = match c.u8() {
        Ok(b) => b,
        Err(_) => return ParseOutcome::NeedMoreData,
    };
    if hs_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return ParseOutcome::Malformed("handshake message is not a ClientHello");
    }
    let hs_len = match c.u24() {
        Ok(n) => n,
        Err(_) => return ParseOutcome::NeedMoreData,
    };
    if c.remaining() < hs_len {
        return ParseOutcome::NeedMoreData;
    }

    macro_rules! bail {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(msg) => return ParseOutcome::Malformed(msg),
            }
        };
    }

    bail!(c.take(2)); // legacy client_version
    bail!(c.take(32)); // random
    let session_id_len = bail!(c.u8()) as usize;
    bail!(c.take(session_id_len));
    let cipher_suites_len = bail!(c.u16()) as usize;
    bail!(c.take(cipher_suites_len));
    let compression_methods_len = bail!(c.u8()) as usize;
    bail!(c.take(compression_methods_len));

    if c.remaining() < 2 {
        // no extensions block: well-formed ClientHello, just no SNI
        return ParseOutcome::Malformed("no server_name extension present");
    }
    let extensions_len = bail!(c.u16()) as usize;
    if c.remaining() < extensions_len {
        return ParseOutcome::Malformed("truncated extensions block");
    }
    let extensions_end = c.pos + extensions_len;
    while c.pos < extensions_end {
        let ext_type = bail!(c.u16());
        let ext_len = bail!(c.u16()) as usize;
        let ext_data = bail!(c.take(ext_len));
        if ext_type == EXT_SERVER_NAME {
            return match parse_server_name_extension(ext_data) {
                Ok(Some(hostname)) => ParseOutcome::Hostname(hostname),
                Ok(None) => ParseOutcome::Malformed("server_name extension has no host_name"),
                Err(msg) => ParseOutcome::Malformed(msg),
            };
        }
    }
    ParseOutcome::Malformed("no server_name extension present")
}

#[derive(Debug)]
pub enum SniError {
    Timeout,
    ClosedByClient,
    Io(io::Error),
    NotTls(&'static str),
}

impl std::fmt::Display for SniError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SniError::Timeout => write!(f, "timed out waiting for ClientHello"),
            SniError::ClosedByClient => write!(f, "client closed before sending ClientHello"),
            SniError::Io(e) => write!(f, "io error reading ClientHello: {e}"),
            SniError::NotTls(msg) => write!(f, "not a valid TLS ClientHello: {msg}"),
        }
    }
}

impl std::error::Error for SniError {}

/// Reads enough of the connection to extract the SNI hostname, then hands
/// back a stream that replays the buffered bytes before falling through
/// to the live connection, so a following TLS handshake sees the exact
/// same ClientHello bytes.
pub struct SniSniffer;

impl SniSniffer {
    pub async fn sniff<S>(mut conn: S, read_timeout: Duration) -> Result<(ReplayStream<S>, String), SniError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let hostname = timeout(read_timeout, async {
            loop {
                match try_parse(&buf) {
                    ParseOutcome::Hostname(h) => return Ok(h),
                    ParseOutcome::Malformed(msg) => return Err(SniError::NotTls(msg)),
                    ParseOutcome::NeedMoreData => {
                        let n = conn.read_buf(&mut buf).await.map_err(SniError::Io)?;
                        if n == 0 {
                            return Err(SniError::ClosedByClient);
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| SniError::Timeout)??;

        Ok((ReplayStream::new(buf, conn), hostname))
    }
}

/// Wraps a connection so reads first drain `prefix` (the bytes consumed
/// while sniffing) before falling through to the underlying stream.
/// Writes pass straight through.
pub struct ReplayStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        ReplayStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = std::cmp::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Boxes a sniffed stream into the pipeline's [`AnyStream`].
pub fn boxed<S>(stream: ReplayStream<S>) -> AnyStream
where
    S: Stream + 'static,
{
    Box::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut ext_sni = Vec::new();
        ext_sni.extend_from_slice(&((1 + 2 + hostname.len()) as u16).to_be_bytes()); // server_name_list len
        ext_sni.push(SERVER_NAME_TYPE_HOST_NAME);
        ext_sni.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        ext_sni.extend_from_slice(hostname.as_bytes());

        let mut ext = Vec::new();
        ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        ext.extend_from_slice(&(ext_sni.len() as u16).to_be_bytes());
        ext.extend_from_slice(&ext_sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites_len
        body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        body.push(1); // compression_methods_len
        body.push(0);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..4]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(TLS_CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // legacy_record_version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parses_sni_from_well_formed_client_hello() {
        let record = client_hello_with_sni("example.com");
        match try_parse(&record) {
            ParseOutcome::Hostname(h) => assert_eq!(h, "example.com"),
            _ => panic!("expected a parsed hostname"),
        }
    }

    #[test]
    fn needs_more_data_on_truncated_record() {
        let record = client_hello_with_sni("example.com");
        match try_parse(&record[..10]) {
            ParseOutcome::NeedMoreData => {}
            _ => panic!("expected NeedMoreData"),
        }
    }

    #[test]
    fn rejects_non_tls_bytes() {
        let buf = b"GET / HTTP/1.1\r\n\r\n";
        match try_parse(buf) {
            ParseOutcome::Malformed(_) => {}
            _ => panic!("expected Malformed"),
        }
    }

    #[tokio::test]
    async fn sniff_extracts_hostname_and_replays_prefix() {
        let record = client_hello_with_sni("example.com");
        let mut full = record.clone();
        full.extend_from_slice(b"trailing-app-bytes");

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server.write_all(&full).await.unwrap();
        });

        let (mut replay, hostname) = SniSniffer::sniff(client, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(hostname, "example.com");

        let mut out = vec![0u8; full.len()];
        replay.read_exact(&mut out).await.unwrap();
        assert_eq!(out, full);
    }

    #[tokio::test]
    async fn sniff_times_out_on_silent_client() {
        let (client, _server) = tokio::io::duplex(4096);
        let err = SniSniffer::sniff(client, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SniError::Timeout));
    }

    #[test]
    fn replay_stream_drains_prefix_before_inner() {
        let inner = tokio_test::io::Builder::new().read(b"inner-data").build();
        let mut replay = ReplayStream::new(BytesMut::from(&b"prefix-"[..]), inner);

        let mut buf = vec![0u8; 7];
        tokio_test::block_on(replay.read_exact(&mut buf)).unwrap();
        assert_eq!(&buf, b"prefix-");

        let mut buf2 = vec![0u8; 10];
        tokio_test::block_on(replay.read_exact(&mut buf2)).unwrap();
        assert_eq!(&buf2, b"inner-data");
    }
}
