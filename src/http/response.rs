//! HTTP/1.1 response assembly.
//!
//! Headers are appended into the connection's write buffer; the body is a
//! privately mapped read-only file owned by the response, handed to the
//! connection as a borrowed slice for the scatter write. The mapping is
//! released before the next `init` and on unmap, so the borrow can never
//! outlive it.

use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;

use crate::buffer::Buffer;

/// Suffix-to-MIME table; anything else is served as `text/plain`.
fn mime_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(at) => &path[at..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

fn reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

/// Canned page shipped for an error status.
fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Builder for one response, holding the mapped body between `build` and
/// the final write.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<u16>,
    path: String,
    src_dir: PathBuf,
    keep_alive: bool,
    file: Option<Mmap>,
    file_len: usize,
}

impl HttpResponse {
    /// An empty response with the status sentinel unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the parameters for the next `build`, releasing any mapping
    /// the previous response still holds. `code` of `None` lets `build`
    /// decide from the file status.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) {
        self.unmap();
        self.code = code;
        self.path = path.to_owned();
        self.src_dir = src_dir.to_path_buf();
        self.keep_alive = keep_alive;
    }

    /// Resolves the target file, fixes up the status code, and appends
    /// status line and headers to `buf`. On success the body is mapped
    /// and exposed through [`file`](Self::file); on failure an inline
    /// error body is appended instead.
    pub fn build(&mut self, buf: &mut Buffer) {
        let mut meta = None;
        // a protocol error decided the status already; the file cascade
        // must not downgrade it to 404 for the empty path
        if self.code != Some(400) {
            match fs::metadata(self.target()) {
                Err(_) => self.code = Some(404),
                Ok(m) if m.is_dir() => self.code = Some(404),
                Ok(m) if m.permissions().mode() & 0o004 == 0 => self.code = Some(403),
                Ok(m) => {
                    if self.code.is_none() {
                        self.code = Some(200);
                    }
                    meta = Some(m);
                }
            }
        }
        if let Some(page) = self.code.and_then(error_page) {
            self.path = page.to_owned();
            meta = fs::metadata(self.target()).ok();
        }
        self.append_status_line(buf);
        self.append_headers(buf);
        self.append_content(buf, meta);
    }

    /// Status code decided by the last `build`, if any.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// Whether this response keeps the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The mapped body, when the target file was successfully mapped.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    /// Size of the mapped body in bytes, zero without a mapping.
    pub fn file_len(&self) -> usize {
        self.file_len
    }

    /// Releases the mapped body. Safe to call repeatedly.
    pub fn unmap(&mut self) {
        self.file = None;
        self.file_len = 0;
    }

    fn target(&self) -> PathBuf {
        let mut joined = OsString::from(self.src_dir.as_os_str());
        joined.push(&self.path);
        PathBuf::from(joined)
    }

    fn append_status_line(&mut self, buf: &mut Buffer) {
        let status = match self.code.and_then(reason) {
            Some(status) => status,
            None => {
                self.code = Some(400);
                "Bad Request"
            }
        };
        let code = self.code.unwrap_or(400);
        buf.append(format!("HTTP/1.1 {code} {status}\r\n").as_bytes());
    }

    fn append_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_type(&self.path)).as_bytes());
    }

    fn append_content(&mut self, buf: &mut Buffer, meta: Option<Metadata>) {
        let target = self.target();
        let file = match meta.map(|_| File::open(&target)) {
            Some(Ok(file)) => file,
            Some(Err(_)) | None => return self.error_content(buf, "File NotFound!"),
        };
        debug!("serving {}", target.display());
        // SAFETY: the mapping is private and read-only; the static assets
        // it maps are not truncated while the server runs.
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(_) => return self.error_content(buf, "File NotFound!"),
        };
        buf.append(format!("Content-length: {}\r\n\r\n", map.len()).as_bytes());
        self.file_len = map.len();
        self.file = Some(map);
    }

    /// Inline HTML body used when the target cannot be opened or mapped.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) {
        let status = self.code.and_then(reason).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p>\
             <hr><em>rivet</em></body></html>",
            self.code.unwrap_or(400),
            status,
            message
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use crate::buffer::Buffer;

    use super::{mime_type, HttpResponse};

    fn write_page(dir: &Path, name: &str, contents: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        // keep the world-readable bit independent of the ambient umask
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn build(dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> (HttpResponse, String) {
        let mut response = HttpResponse::new();
        response.init(dir, path, keep_alive, code);
        let mut buf = Buffer::new();
        response.build(&mut buf);
        let head = buf.take_string();
        (response, head)
    }

    #[test]
    fn mime_table_covers_known_suffixes() {
        assert_eq!("text/html", mime_type("/index.html"));
        assert_eq!("image/png", mime_type("/a/b.png"));
        assert_eq!("image/jpeg", mime_type("/x.jpeg"));
        assert_eq!("text/plain", mime_type("/noext"));
        assert_eq!("text/plain", mime_type("/odd.weird"));
    }

    #[test]
    fn existing_file_yields_200_with_mapped_body() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "index.html", "<html>hi</html>");
        let (response, head) = build(dir.path(), "/index.html", false, Some(200));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 15\r\n\r\n"));
        assert_eq!(15, response.file_len());
        assert_eq!(Some(&b"<html>hi</html>"[..]), response.file());
    }

    #[test]
    fn keep_alive_response_advertises_it() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "index.html", "x");
        let (_, head) = build(dir.path(), "/index.html", true, Some(200));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    }

    #[test]
    fn missing_file_becomes_404_with_canned_page() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "404.html", "gone");
        let (response, head) = build(dir.path(), "/nope.html", false, Some(200));
        assert_eq!(Some(404), response.code());
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(Some(&b"gone"[..]), response.file());
    }

    #[test]
    fn directory_target_becomes_404() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_page(dir.path(), "404.html", "gone");
        let (response, _) = build(dir.path(), "/sub", false, None);
        assert_eq!(Some(404), response.code());
    }

    #[test]
    fn unreadable_file_becomes_403() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "secret.html", "hidden");
        fs::set_permissions(
            dir.path().join("secret.html"),
            fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        write_page(dir.path(), "403.html", "forbidden");
        let (response, head) = build(dir.path(), "/secret.html", false, None);
        assert_eq!(Some(403), response.code());
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(Some(&b"forbidden"[..]), response.file());
    }

    #[test]
    fn explicit_400_survives_the_file_cascade() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "400.html", "bad");
        let (response, head) = build(dir.path(), "", false, Some(400));
        assert_eq!(Some(400), response.code());
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(Some(&b"bad"[..]), response.file());
    }

    #[test]
    fn sentinel_code_becomes_200_for_good_files() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "welcome.html", "w");
        let (response, _) = build(dir.path(), "/welcome.html", false, None);
        assert_eq!(Some(200), response.code());
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_body() {
        let dir = tempfile::tempdir().unwrap();
        // no 404.html on disk either
        let (response, head) = build(dir.path(), "/nope.html", false, None);
        assert_eq!(Some(404), response.code());
        assert!(head.contains("File NotFound!"));
        assert!(head.contains("<em>rivet</em>"));
        assert_eq!(None, response.file());
    }

    #[test]
    fn init_releases_previous_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "index.html", "first");
        let (mut response, _) = build(dir.path(), "/index.html", false, None);
        assert!(response.file().is_some());
        response.init(dir.path(), "/index.html", false, None);
        assert!(response.file().is_none());
        assert_eq!(0, response.file_len());
        response.unmap();
        response.unmap();
    }
}
