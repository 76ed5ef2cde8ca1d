/// Contents of a peer's ClientHello, captured before the engine selects a
/// context.
///
/// Populated on the server side when ClientHello parsing is enabled on the
/// context; observers run against it before the server-name callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Legacy protocol version from the hello body (e.g. 3.3 for TLS 1.2;
    /// TLS 1.3 clients also send 3.3 here and negotiate via extension).
    pub major_version: u8,
    pub minor_version: u8,
    /// Offered cipher suites, in the client's preference order.
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Extension type codes, in order of appearance.
    pub extensions: Vec<u16>,
    /// The server_name extension's hostname, when present.
    pub server_name: Option<String>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }
}

/// Parses a ClientHello from raw record-layer bytes.
///
/// The hello may be fragmented across several handshake records; fragments
/// are reassembled first. Returns `None` until a complete hello is present
/// or when the bytes are not a ClientHello at all.
pub(crate) fn parse_client_hello(raw: &[u8]) -> Option<ClientHelloInfo> {
    const CONTENT_TYPE_HANDSHAKE: u8 = 22;
    const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;

    // Reassemble the handshake stream from the record layer.
    let mut payload = Vec::new();
    let mut records = Cursor::new(raw);
    while records.remaining() >= 5 {
        let content_type = records.u8()?;
        records.take(2)?; // record-layer version
        let len = records.u16()? as usize;
        let fragment = if records.remaining() >= len {
            records.take(len)?
        } else {
            let partial = records.take(records.remaining())?;
            if content_type == CONTENT_TYPE_HANDSHAKE {
                payload.extend_from_slice(partial);
            }
            break;
        };
        if content_type == CONTENT_TYPE_HANDSHAKE {
            payload.extend_from_slice(fragment);
        }
    }

    let mut cur = Cursor::new(&payload);
    if cur.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let body_len =
        u32::from_be_bytes([0, cur.u8()?, cur.u8()?, cur.u8()?]) as usize;
    if cur.remaining() < body_len {
        return None;
    }

    let mut info = ClientHelloInfo {
        major_version: cur.u8()?,
        minor_version: cur.u8()?,
        ..Default::default()
    };
    cur.take(32)?; // client random
    let session_id_len = cur.u8()? as usize;
    cur.take(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    let mut suites = Cursor::new(cur.take(cipher_suites_len)?);
    while suites.remaining() >= 2 {
        info.cipher_suites.push(suites.u16()?);
    }

    let compression_len = cur.u8()? as usize;
    info.compression_methods = cur.take(compression_len)?.to_vec();

    // Extensions are optional (SSLv3-style hellos stop here).
    if cur.remaining() >= 2 {
        let extensions_len = cur.u16()? as usize;
        let mut exts = Cursor::new(cur.take(extensions_len.min(cur.remaining()))?);
        while exts.remaining() >= 4 {
            let ext_type = exts.u16()?;
            let ext_len = exts.u16()? as usize;
            let ext_data = exts.take(ext_len.min(exts.remaining()))?;
            info.extensions.push(ext_type);
            if ext_type == 0 {
                info.server_name = parse_server_name(ext_data);
            }
        }
    }

    Some(info)
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(data);
    let list_len = cur.u16()? as usize;
    let mut list = Cursor::new(cur.take(list_len.min(cur.remaining()))?);
    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == 0 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesized_hello() -> Vec<u8> {
        // Handshake body: ClientHello with two suites, null compression,
        // server_name and ALPN extension codes.
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // empty session id
        body.extend_from_slice(&[0, 4, 0x13, 0x01, 0x13, 0x02]); // suites
        body.extend_from_slice(&[1, 0]); // compression: null

        let host = b"alpha.example";
        let mut sni = Vec::new();
        sni.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        sni.push(0); // host_name
        sni.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni.extend_from_slice(host);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&[0, 0]); // server_name
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);
        extensions.extend_from_slice(&[0, 16, 0, 0]); // empty ALPN

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![1]; // client_hello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);
        handshake
    }

    fn wrap_records(handshake: &[u8], fragment_size: usize) -> Vec<u8> {
        let mut raw = Vec::new();
        for chunk in handshake.chunks(fragment_size) {
            raw.push(22);
            raw.extend_from_slice(&[3, 1]);
            raw.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            raw.extend_from_slice(chunk);
        }
        raw
    }

    #[test]
    fn parses_a_single_record_hello() {
        let handshake = synthesized_hello();
        let raw = wrap_records(&handshake, handshake.len());
        let info = parse_client_hello(&raw).expect("complete hello");
        assert_eq!((info.major_version, info.minor_version), (3, 3));
        assert_eq!(info.cipher_suites, vec![0x1301, 0x1302]);
        assert_eq!(info.compression_methods, vec![0]);
        assert_eq!(info.extensions, vec![0, 16]);
        assert_eq!(info.server_name.as_deref(), Some("alpha.example"));
    }

    #[test]
    fn reassembles_fragmented_records() {
        let handshake = synthesized_hello();
        let raw = wrap_records(&handshake, 10);
        let info = parse_client_hello(&raw).expect("reassembled hello");
        assert_eq!(info.server_name.as_deref(), Some("alpha.example"));
    }

    #[test]
    fn rejects_non_hello_bytes() {
        assert_eq!(parse_client_hello(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(parse_client_hello(&[]), None);

        // Incomplete hello: record present but body truncated.
        let handshake = synthesized_hello();
        let raw = wrap_records(&handshake[..20], 20);
        assert_eq!(parse_client_hello(&raw), None);
    }
}
