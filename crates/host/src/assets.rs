//! Sandboxed asset files for guests.
//!
//! Guests address assets by relative path only. Writes land under the user
//! root; reads fall back from the user root to the bundled root and then to a
//! remote mirror whose hits are copied into the bundled root.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::bridge::Bridge;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset path escapes the sandbox: {0}")]
    PathEscape(String),
    #[error("asset path is empty")]
    EmptyPath,
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("unknown encoding `{0}`")]
    UnknownEncoding(String),
    #[error("unsupported write flag `{0}`")]
    UnsupportedFlag(String),
    #[error("asset already exists: {0}")]
    Exists(String),
    #[error("invalid {encoding} data: {message}")]
    Decode {
        encoding: &'static str,
        message: String,
    },
    #[error("asset io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote asset fetch failed: {0}")]
    Remote(String),
}

impl AssetError {
    pub fn status(&self) -> u16 {
        match self {
            AssetError::NotFound(_) => 404,
            AssetError::Io(_) | AssetError::Remote(_) => 500,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
    Binary,
    Utf16le,
    Base64,
    Hex,
    Buffer,
}

impl Encoding {
    /// `None` means raw bytes.
    pub fn parse(value: Option<&str>) -> Result<Self, AssetError> {
        let Some(value) = value else {
            return Ok(Encoding::Buffer);
        };
        match value.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" => Ok(Encoding::Latin1),
            "binary" => Ok(Encoding::Binary),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16le),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            "buffer" => Ok(Encoding::Buffer),
            _ => Err(AssetError::UnknownEncoding(value.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Binary => "binary",
            Encoding::Utf16le => "utf16le",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
            Encoding::Buffer => "buffer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetData {
    Text(String),
    Bytes(Vec<u8>),
}

/// Render file bytes in the requested encoding.
pub fn decode_for_read(bytes: Vec<u8>, encoding: Encoding) -> AssetData {
    match encoding {
        Encoding::Buffer => AssetData::Bytes(bytes),
        Encoding::Utf8 => AssetData::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Encoding::Ascii => AssetData::Text(bytes.iter().map(|b| (b & 0x7f) as char).collect()),
        Encoding::Latin1 | Encoding::Binary => {
            AssetData::Text(bytes.iter().map(|b| *b as char).collect())
        }
        Encoding::Utf16le => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            AssetData::Text(String::from_utf16_lossy(&units))
        }
        Encoding::Base64 => AssetData::Text(STANDARD.encode(bytes)),
        Encoding::Hex => AssetData::Text(hex::encode(bytes)),
    }
}

/// Turn guest data into the bytes to store. Raw bytes pass through.
pub fn encode_for_write(data: AssetData, encoding: Encoding) -> Result<Vec<u8>, AssetError> {
    let text = match data {
        AssetData::Bytes(bytes) => return Ok(bytes),
        AssetData::Text(text) => text,
    };
    match encoding {
        Encoding::Utf8 | Encoding::Buffer => Ok(text.into_bytes()),
        Encoding::Ascii | Encoding::Latin1 | Encoding::Binary => {
            Ok(text.chars().map(|ch| ch as u32 as u8).collect())
        }
        Encoding::Utf16le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        Encoding::Base64 => STANDARD.decode(text.trim()).map_err(|err| AssetError::Decode {
            encoding: encoding.name(),
            message: err.to_string(),
        }),
        Encoding::Hex => hex::decode(text.trim()).map_err(|err| AssetError::Decode {
            encoding: encoding.name(),
            message: err.to_string(),
        }),
    }
}

/// POSIX-style `fs.writeFile` flag.
fn open_options(flag: &str) -> Result<OpenOptions, AssetError> {
    let mut options = OpenOptions::new();
    let read = flag.ends_with('+');
    match flag.trim_end_matches('+') {
        "w" => options.write(true).create(true).truncate(true),
        "wx" | "xw" => options.write(true).create_new(true),
        "a" => options.append(true).create(true),
        "ax" | "xa" => options.append(true).create_new(true),
        _ => return Err(AssetError::UnsupportedFlag(flag.to_string())),
    };
    if flag.matches('+').count() > 1 {
        return Err(AssetError::UnsupportedFlag(flag.to_string()));
    }
    options.read(read);
    Ok(options)
}

/// Normalise a guest path and join it onto `root`.
///
/// Backslashes count as separators, empty and `.` segments are dropped, and
/// any all-dot segment (`..`, `...`) or `~` rejects the whole path.
pub fn sandbox_path(root: &Path, relative: &str) -> Result<PathBuf, AssetError> {
    let normalized = relative.replace('\\', "/");
    let mut clean = PathBuf::new();
    for segment in normalized.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == "~" || segment.chars().all(|ch| ch == '.') {
            return Err(AssetError::PathEscape(relative.to_string()));
        }
        clean.push(segment);
    }
    if clean.as_os_str().is_empty() {
        return Err(AssetError::EmptyPath);
    }

    let resolved = root.join(&clean);
    let inside = resolved
        .strip_prefix(root)
        .map(|rest| rest.components().all(|c| matches!(c, Component::Normal(_))))
        .unwrap_or(false);
    if !inside || escapes_via_link(root, &resolved) {
        return Err(AssetError::PathEscape(relative.to_string()));
    }
    Ok(resolved)
}

/// Resolve the deepest existing ancestor so a symlink inside the root cannot
/// point outside it.
fn escapes_via_link(root: &Path, path: &Path) -> bool {
    let Ok(root) = root.canonicalize() else {
        return false;
    };
    let mut probe = Some(path);
    while let Some(candidate) = probe {
        if let Ok(real) = candidate.canonicalize() {
            return !real.starts_with(&root);
        }
        probe = candidate.parent();
    }
    false
}

#[derive(Clone)]
struct RemoteMirror {
    base: url::Url,
    client: reqwest::Client,
    bridge: Bridge,
}

#[derive(Clone)]
pub struct AssetSandbox {
    user_root: PathBuf,
    bundled_root: PathBuf,
    remote: Option<RemoteMirror>,
}

impl AssetSandbox {
    pub fn new(user_root: impl Into<PathBuf>, bundled_root: impl Into<PathBuf>) -> Self {
        Self {
            user_root: user_root.into(),
            bundled_root: bundled_root.into(),
            remote: None,
        }
    }

    /// Enable the online fallback for reads.
    pub fn with_remote(
        mut self,
        base: url::Url,
        timeout: Duration,
        bridge: Bridge,
    ) -> Result<Self, AssetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AssetError::Remote(format!("client setup: {}", err)))?;
        self.remote = Some(RemoteMirror {
            base,
            client,
            bridge,
        });
        Ok(self)
    }

    pub fn user_root(&self) -> &Path {
        &self.user_root
    }

    pub fn write(
        &self,
        relative: &str,
        bytes: &[u8],
        flag: Option<&str>,
    ) -> Result<(), AssetError> {
        let flag = flag.unwrap_or("w");
        let options = open_options(flag)?;
        let target = sandbox_path(&self.user_root, relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = options.open(&target).map_err(|err| match err.kind() {
            ErrorKind::AlreadyExists => AssetError::Exists(relative.to_string()),
            _ => AssetError::Io(err),
        })?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>, AssetError> {
        for root in [&self.user_root, &self.bundled_root] {
            let path = sandbox_path(root, relative)?;
            match std::fs::read(&path) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(AssetError::Io(err)),
            }
        }

        let Some(remote) = &self.remote else {
            return Err(AssetError::NotFound(relative.to_string()));
        };
        let bytes = self.fetch_remote(remote, relative)?;
        if let Err(err) = self.store_bundled(relative, &bytes) {
            tracing::warn!("failed to cache remote asset {}: {}", relative, err);
        }
        Ok(bytes)
    }

    fn fetch_remote(&self, remote: &RemoteMirror, relative: &str) -> Result<Vec<u8>, AssetError> {
        // validated again so the remote url can never climb above its base
        let clean = sandbox_path(Path::new(""), relative)?;
        let joined = clean.to_string_lossy().replace('\\', "/");
        let url = remote
            .base
            .join(&joined)
            .map_err(|err| AssetError::Remote(err.to_string()))?;
        let client = remote.client.clone();
        tracing::debug!("fetching remote asset {}", url);

        let result = remote
            .bridge
            .run(async move {
                let response = client.get(url).send().await?;
                let status = response.status();
                let bytes = response.bytes().await?;
                Ok::<_, reqwest::Error>((status, bytes.to_vec()))
            })
            .map_err(|err| AssetError::Remote(err.to_string()))?;

        match result {
            Ok((status, bytes)) if status.is_success() => Ok(bytes),
            Ok((status, _)) if status == reqwest::StatusCode::NOT_FOUND => {
                Err(AssetError::NotFound(relative.to_string()))
            }
            Ok((status, _)) => Err(AssetError::Remote(format!("status {}", status))),
            Err(err) => Err(AssetError::Remote(err.to_string())),
        }
    }

    fn store_bundled(&self, relative: &str, bytes: &[u8]) -> Result<(), AssetError> {
        let target = sandbox_path(&self.bundled_root, relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, bytes)?;
        Ok(())
    }
}

fn is_missing(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, AssetSandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = AssetSandbox::new(dir.path().join("user"), dir.path().join("bundled"));
        (dir, sandbox)
    }

    #[test]
    fn parent_segments_fail_closed() {
        let (dir, sandbox) = sandbox();
        let err = sandbox
            .write("../../etc/passwd", b"x", None)
            .expect_err("escape must fail");
        assert!(matches!(err, AssetError::PathEscape(_)));
        assert_eq!(err.status(), 400);
        assert!(!dir.path().join("user").exists());

        for path in ["a/../../b", "..\\x", "~/x", "a/.../b", ""] {
            assert!(sandbox_path(Path::new("/srv/assets"), path).is_err(), "{path}");
        }
    }

    #[test]
    fn separators_and_dots_are_normalised() {
        let root = Path::new("/srv/assets");
        assert_eq!(
            sandbox_path(root, "\\a\\.\\b//c.txt").expect("path"),
            PathBuf::from("/srv/assets/a/b/c.txt")
        );
        assert_eq!(
            sandbox_path(root, "/etc/passwd").expect("path"),
            PathBuf::from("/srv/assets/etc/passwd")
        );
    }

    #[test]
    fn write_then_read_round_trips_text() {
        let (_dir, sandbox) = sandbox();
        sandbox.write("a/b.txt", b"hello", None).expect("write");
        let bytes = sandbox.read("a/b.txt").expect("read");
        assert_eq!(
            decode_for_read(bytes, Encoding::Utf8),
            AssetData::Text("hello".into())
        );
    }

    #[test]
    fn read_falls_back_to_bundled_root() {
        let (dir, sandbox) = sandbox();
        std::fs::create_dir_all(dir.path().join("bundled/img")).expect("mkdir");
        std::fs::write(dir.path().join("bundled/img/logo.svg"), "<svg/>").expect("write");
        assert_eq!(sandbox.read("img/logo.svg").expect("read"), b"<svg/>");
        assert!(matches!(
            sandbox.read("img/missing.svg"),
            Err(AssetError::NotFound(_))
        ));
    }

    /// Serves `img/logo.svg`, fails `broken.svg` with a 500 and answers 404
    /// for everything else.
    fn mirror() -> url::Url {
        use std::io::Read;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}/assets/", listener.local_addr().expect("addr"));
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let (status, body) = match head.split_whitespace().nth(1) {
                    Some("/assets/img/logo.svg") => ("200 OK", "<svg/>"),
                    Some("/assets/broken.svg") => ("500 Internal Server Error", "boom"),
                    _ => ("404 Not Found", ""),
                };
                let _ = write!(
                    stream,
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
            }
        });
        url::Url::parse(&base).expect("url")
    }

    #[test]
    fn remote_hits_are_cached_into_the_bundled_root() {
        let (dir, sandbox) = sandbox();
        let bridge = Bridge::current_or_owned().expect("bridge");
        let sandbox = sandbox
            .with_remote(mirror(), Duration::from_secs(5), bridge)
            .expect("remote");

        assert_eq!(sandbox.read("img/logo.svg").expect("remote read"), b"<svg/>");
        let cached = dir.path().join("bundled/img/logo.svg");
        assert_eq!(std::fs::read(&cached).expect("written back"), b"<svg/>");

        let err = sandbox.read("img/missing.svg").expect_err("remote 404");
        assert!(matches!(err, AssetError::NotFound(_)));
        assert_eq!(err.status(), 404);
        assert!(!dir.path().join("bundled/img/missing.svg").exists());

        let err = sandbox.read("broken.svg").expect_err("remote 500");
        assert!(matches!(err, AssetError::Remote(_)));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn write_flags_follow_posix_semantics() {
        let (_dir, sandbox) = sandbox();
        sandbox.write("log.txt", b"a", Some("a")).expect("append create");
        sandbox.write("log.txt", b"b", Some("a+")).expect("append");
        assert_eq!(sandbox.read("log.txt").expect("read"), b"ab");

        assert!(matches!(
            sandbox.write("log.txt", b"c", Some("wx")),
            Err(AssetError::Exists(_))
        ));
        sandbox.write("log.txt", b"c", Some("w+")).expect("truncate");
        assert_eq!(sandbox.read("log.txt").expect("read"), b"c");

        assert!(matches!(
            sandbox.write("log.txt", b"c", Some("r")),
            Err(AssetError::UnsupportedFlag(_))
        ));
        assert!(matches!(
            sandbox.write("log.txt", b"c", Some("w++")),
            Err(AssetError::UnsupportedFlag(_))
        ));
    }

    #[test]
    fn encodings() {
        let bytes = vec![0x68, 0x69, 0xff];
        assert_eq!(
            decode_for_read(bytes.clone(), Encoding::Hex),
            AssetData::Text("6869ff".into())
        );
        assert_eq!(
            decode_for_read(bytes.clone(), Encoding::Base64),
            AssetData::Text("aGn/".into())
        );
        assert_eq!(
            decode_for_read(bytes.clone(), Encoding::Latin1),
            AssetData::Text("hi\u{ff}".into())
        );
        assert_eq!(
            encode_for_write(AssetData::Text("aGn/".into()), Encoding::Base64).expect("b64"),
            bytes
        );
        assert_eq!(
            encode_for_write(AssetData::Text("hi".into()), Encoding::Utf16le).expect("utf16"),
            vec![0x68, 0x00, 0x69, 0x00]
        );
        assert!(encode_for_write(AssetData::Text("zz".into()), Encoding::Hex).is_err());
        assert!(matches!(
            Encoding::parse(Some("ebcdic")),
            Err(AssetError::UnknownEncoding(_))
        ));
        assert_eq!(Encoding::parse(None).expect("default"), Encoding::Buffer);
    }
}
