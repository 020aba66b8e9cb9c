// SPDX-License-Identifier: MIT

// boringproxy - SNI peeker
// Reads a TLS ClientHello from a raw stream without consuming it: the caller
// gets back every byte read so far plus the server name, and replays the
// bytes through a PeekedStream before handing the connection on.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Upper bound on how many bytes we are willing to buffer while waiting for
/// a complete ClientHello record (record header + maximum record payload).
pub const MAX_CLIENT_HELLO: usize = 5 + 16_384;

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOST_NAME: u8 = 0;

/// Outcome of parsing a (possibly partial) ClientHello buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum HelloParse {
    /// More bytes are needed before the record can be judged.
    Incomplete,
    /// A full ClientHello was parsed.
    Complete { server_name: Option<String> },
}

/// Read a TLS ClientHello from `stream`, returning all bytes consumed and
/// the SNI host name, if the hello carried one.
///
/// The returned buffer must be replayed in front of the stream (see
/// [`crate::stream::PeekedStream`]) so the handshake still works downstream.
pub async fn peek_client_hello<S>(stream: &mut S) -> Result<(Vec<u8>, Option<String>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let HelloParse::Complete { server_name } = parse_client_hello(&buf)? {
            return Ok((buf, server_name));
        }
        if buf.len() >= MAX_CLIENT_HELLO {
            return Err(Error::MalformedClientHello);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // EOF before the hello finished.
            return Err(Error::MalformedClientHello);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse a buffered prefix of a TLS connection.
///
/// Returns `Incomplete` until a whole handshake record is buffered, then
/// either the server name or an error for anything that is not a ClientHello.
pub fn parse_client_hello(buf: &[u8]) -> Result<HelloParse> {
    if buf.len() < 5 {
        return Ok(HelloParse::Incomplete);
    }

    if buf[0] != RECORD_TYPE_HANDSHAKE || buf[1] != 0x03 {
        return Err(Error::NotTls);
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len == 0 || record_len > MAX_CLIENT_HELLO - 5 {
        return Err(Error::MalformedClientHello);
    }
    if buf.len() < 5 + record_len {
        return Ok(HelloParse::Incomplete);
    }

    let mut r = Reader::new(&buf[5..5 + record_len]);

    if r.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::MalformedClientHello);
    }
    let hello_len = r.u24()? as usize;
    // A ClientHello fragmented across records is vanishingly rare; treat it
    // as unparseable and let the caller close the connection.
    if hello_len > r.remaining() {
        return Err(Error::MalformedClientHello);
    }

    r.skip(2)?; // legacy client version
    r.skip(32)?; // random
    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;
    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;
    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    if r.remaining() == 0 {
        // No extensions at all; a valid hello without SNI.
        return Ok(HelloParse::Complete { server_name: None });
    }

    let extensions_len = r.u16()? as usize;
    let mut ext = Reader::new(r.take(extensions_len)?);

    while ext.remaining() >= 4 {
        let ext_type = ext.u16()?;
        let ext_len = ext.u16()? as usize;
        let data = ext.take(ext_len)?;

        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Reader::new(data);
        let list_len = names.u16()? as usize;
        let mut list = Reader::new(names.take(list_len)?);
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == SNI_TYPE_HOST_NAME {
                let host = std::str::from_utf8(name)
                    .map_err(|_| Error::MalformedClientHello)?
                    .to_string();
                return Ok(HelloParse::Complete {
                    server_name: Some(host),
                });
            }
        }
    }

    Ok(HelloParse::Complete { server_name: None })
}

/// Bounds-checked cursor over a byte slice. Overruns inside a record that
/// claimed to be complete are malformed, not incomplete.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::MalformedClientHello);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal but well-formed ClientHello record.
    fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        body.extend_from_slice(&[0x01, 0x00]); // compression: null

        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let host = name.as_bytes();
            let entry_len = 3 + host.len();
            extensions.extend_from_slice(&[0x00, 0x00]); // server_name
            extensions.extend_from_slice(&((entry_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(entry_len as u16).to_be_bytes());
            extensions.push(0); // host_name
            extensions.extend_from_slice(&(host.len() as u16).to_be_bytes());
            extensions.extend_from_slice(host);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parses_server_name() {
        let hello = client_hello(Some("a.example"));
        match parse_client_hello(&hello).unwrap() {
            HelloParse::Complete { server_name } => {
                assert_eq!(server_name.as_deref(), Some("a.example"))
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn hello_without_sni_is_valid() {
        let hello = client_hello(None);
        assert_eq!(
            parse_client_hello(&hello).unwrap(),
            HelloParse::Complete { server_name: None }
        );
    }

    #[test]
    fn partial_record_is_incomplete() {
        let hello = client_hello(Some("a.example"));
        for cut in [0, 3, 5, hello.len() - 1] {
            assert_eq!(
                parse_client_hello(&hello[..cut]).unwrap(),
                HelloParse::Incomplete,
                "prefix of {cut} bytes should be incomplete"
            );
        }
    }

    #[test]
    fn non_tls_bytes_are_rejected() {
        assert!(matches!(
            parse_client_hello(b"GET / HTTP/1.1\r\n"),
            Err(Error::NotTls)
        ));
    }

    #[test]
    fn garbage_handshake_is_malformed() {
        // Valid record header, but the payload is not a ClientHello.
        let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x04];
        record.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        assert!(matches!(
            parse_client_hello(&record),
            Err(Error::MalformedClientHello)
        ));
    }

    #[tokio::test]
    async fn peek_reads_across_split_writes() {
        use tokio::io::AsyncWriteExt;

        let hello = client_hello(Some("b.example"));
        let (mut tx, mut rx) = tokio::io::duplex(256);

        let split = hello.len() / 2;
        let (first, second) = (hello[..split].to_vec(), hello[split..].to_vec());
        let writer = tokio::spawn(async move {
            tx.write_all(&first).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(&second).await.unwrap();
            tx
        });

        let (peeked, name) = peek_client_hello(&mut rx).await.unwrap();
        assert_eq!(peeked, hello);
        assert_eq!(name.as_deref(), Some("b.example"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn peek_rejects_plain_http() {
        use tokio::io::AsyncWriteExt;

        let (mut tx, mut rx) = tokio::io::duplex(256);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        drop(tx);

        assert!(peek_client_hello(&mut rx).await.is_err());
    }
}
