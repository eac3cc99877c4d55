use anyhow::{Context as _, Result, anyhow};
use mail_builder::headers::content_type::ContentType;
use mail_builder::mime::MimePart;
use mail_parser::{HeaderName, MessageParser, PartType};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::UNIX_EPOCH;

use crate::Context;
use crate::mail::maildir::Maildir;
use crate::mail::part::{ParsedMail, PartTree, parse_bytes};

pub type MessageRef = Rc<RefCell<Message>>;

/// Where a message's authoritative state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// A file in a local maildir; flags are encoded in the filename.
    Local,
    /// A message on the IMAP proxy's server; flags live in memory and the
    /// body is fetched into a local cache file on demand.
    Remote { id: u32 },
}

/// One email message, local or remote.
///
/// Headers and the MIME tree are parsed once on first access and cached for
/// the process lifetime; flag changes never invalidate them, attachment
/// addition does.
pub struct Message {
    /// For local messages the `:2,<flags>` suffix of this path encodes the
    /// flags; for remote messages it names the local body-cache file.
    path: String,
    backend: Backend,
    /// Canonical in-memory flags, remote messages only.
    remote_flags: String,
    parsed: Option<ParsedMail>,
    /// Bumped on every remote-side mutation; remote flags cannot be read
    /// back from disk, so this is the cache-invalidation signal.
    revision: u64,
    parent: Weak<Maildir>,
}

impl Message {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backend: Backend::Local,
            remote_flags: String::new(),
            parsed: None,
            revision: 0,
            parent: Weak::new(),
        }
    }

    pub fn remote(id: u32, cache_path: impl Into<String>, flags: &str) -> Self {
        Self {
            path: cache_path.into(),
            backend: Backend::Remote { id },
            remote_flags: canonicalize_flags(flags),
            parsed: None,
            revision: 0,
            parent: Weak::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.backend == Backend::Local
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub(crate) fn set_parent(&mut self, parent: Weak<Maildir>) {
        self.parent = parent;
    }

    /// The folder this message belongs to, if it is still alive.
    pub fn parent(&self) -> Option<Rc<Maildir>> {
        self.parent.upgrade()
    }

    fn parent_folder(&self) -> String {
        self.parent()
            .map(|p| p.path().to_string())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Current flags, canonicalized (sorted, deduplicated, uppercase).
    ///
    /// Local flags are parsed from the path's `:2,` suffix; a path inside
    /// `new/` counts as flag `N` no matter what the suffix says. Remote
    /// flags are the in-memory string, which is authoritative because the
    /// server is never polled synchronously.
    pub fn flags(&self) -> String {
        if let Backend::Remote { .. } = self.backend {
            return self.remote_flags.clone();
        }

        if self.path.is_empty() {
            return String::new();
        }

        let mut flags = match self.path.rfind(":2,") {
            Some(pos) => self.path[pos + 3..].to_string(),
            None => String::new(),
        };

        if self.path.contains("/new/") {
            flags.push('N');
        }

        canonicalize_flags(&flags)
    }

    /// Set the flags of a local message by renaming its file. Remote flags
    /// change only through `mark_read`/`mark_unread`, so this is a no-op
    /// for them.
    pub fn set_flags(&mut self, new_flags: &str) -> Result<()> {
        if self.is_remote() {
            return Ok(());
        }

        let flags = canonicalize_flags(new_flags);
        let dst = with_flag_suffix(&self.path, &flags);

        if dst != self.path {
            fs::rename(&self.path, &dst)
                .with_context(|| format!("renaming {} -> {}", self.path, dst))?;
            self.path = dst;
        }

        Ok(())
    }

    /// Install flags on a remote message, as reported by a folder listing.
    pub fn set_remote_flags(&mut self, flags: &str) {
        self.remote_flags = canonicalize_flags(flags);
        self.revision += 1;
        if let Some(parent) = self.parent() {
            parent.bump_mtime();
        }
    }

    /// Add a flag. Returns whether the set changed.
    pub fn add_flag(&mut self, flag: char) -> Result<bool> {
        let flag = flag.to_ascii_uppercase();
        let flags = self.flags();
        if flags.contains(flag) {
            return Ok(false);
        }
        self.set_flags(&format!("{}{}", flags, flag))?;
        Ok(true)
    }

    /// Remove a flag. Returns whether the set changed.
    pub fn remove_flag(&mut self, flag: char) -> Result<bool> {
        let flag = flag.to_ascii_uppercase();
        let flags = self.flags();
        if !flags.contains(flag) {
            return Ok(false);
        }
        let remaining: String = flags.chars().filter(|&c| c != flag).collect();
        self.set_flags(&remaining)?;
        Ok(true)
    }

    pub fn has_flag(&self, flag: char) -> bool {
        self.flags().contains(flag.to_ascii_uppercase())
    }

    /// A message is new when it carries `N` or has not been proven seen
    /// (`S` absent). A message with neither flag is new.
    pub fn is_new(&self) -> bool {
        self.has_flag('N') || !self.has_flag('S')
    }

    /// Mark the message read. Local: move `new/` -> `cur/` adding `S`, or
    /// drop `N`/add `S` in place, one rename either way. Remote: tell the
    /// proxy, then update the in-memory flags optimistically.
    pub fn mark_read(&mut self, ctx: &Context) -> Result<()> {
        if let Backend::Remote { id } = self.backend {
            ctx.proxy_send(&format!("mark_read {} {}", id, self.parent_folder()))?;

            let mut flags: String = self.remote_flags.chars().filter(|&c| c != 'N').collect();
            if !flags.contains('S') {
                flags.push('S');
            }
            self.remote_flags = canonicalize_flags(&flags);
            self.revision += 1;

            if let Some(parent) = self.parent() {
                parent.bump_mtime();
                parent.set_unread(parent.unread_messages().saturating_sub(1));
            }
            return Ok(());
        }

        let was_new = self.is_new();

        if let Some(offset) = self.path.find("/new/") {
            // One rename: into cur/ with an S-bearing flag suffix.
            let moved = format!("{}/cur/{}", &self.path[..offset], &self.path[offset + 5..]);
            let mut flags = suffix_flags(&moved);
            flags.retain(|c| c != 'N');
            flags.push('S');
            let dst = with_flag_suffix(&moved, &canonicalize_flags(&flags));

            fs::rename(&self.path, &dst)
                .with_context(|| format!("renaming {} -> {}", self.path, dst))?;
            self.path = dst;
        } else {
            let mut flags = self.flags();
            flags.retain(|c| c != 'N');
            if !flags.contains('S') {
                flags.push('S');
            }
            self.set_flags(&flags)?;
        }

        if was_new && !self.is_new() {
            if let Some(parent) = self.parent() {
                parent.set_unread(parent.unread_messages().saturating_sub(1));
            }
        }

        Ok(())
    }

    /// Mark the message unread. Local messages just shed `S`; remote
    /// messages go through the proxy with an optimistic flag swap.
    pub fn mark_unread(&mut self, ctx: &Context) -> Result<()> {
        if let Backend::Remote { id } = self.backend {
            ctx.proxy_send(&format!("mark_unread {} {}", id, self.parent_folder()))?;

            let mut flags: String = self.remote_flags.chars().filter(|&c| c != 'S').collect();
            if !flags.contains('N') {
                flags.push('N');
            }
            self.remote_flags = canonicalize_flags(&flags);
            self.revision += 1;

            if let Some(parent) = self.parent() {
                parent.bump_mtime();
                parent.set_unread(parent.unread_messages() + 1);
            }
            return Ok(());
        }

        let was_new = self.is_new();

        if self.has_flag('S') {
            self.remove_flag('S')?;
        }

        if !was_new && self.is_new() {
            if let Some(parent) = self.parent() {
                parent.set_unread(parent.unread_messages() + 1);
            }
        }

        Ok(())
    }

    /// Delete the message: unlink the local file, or tell the proxy for a
    /// remote one. Failures are reported through the error hook; returns
    /// whether the message is gone.
    pub fn delete(&mut self, ctx: &Context) -> bool {
        if let Backend::Remote { id } = self.backend {
            let cmd = format!("delete_message {} {}", id, self.parent_folder());
            if let Err(e) = ctx.proxy_send(&cmd) {
                ctx.hooks.report(&format!("failed to delete remote message: {}", e));
                return false;
            }
            if let Some(parent) = self.parent() {
                parent.bump_mtime();
                parent.forget(std::ptr::from_ref(self), self.is_new());
            }
            return true;
        }

        let was_new = self.is_new();
        if let Err(e) = fs::remove_file(&self.path) {
            ctx.hooks
                .report(&format!("failed to delete {}: {}", self.path, e));
            return false;
        }
        if let Some(parent) = self.parent() {
            parent.forget(std::ptr::from_ref(self), was_new);
        }
        true
    }

    // ------------------------------------------------------------------
    // Headers and MIME parts
    // ------------------------------------------------------------------

    /// All headers: lower-cased name -> decoded value, last duplicate wins.
    pub fn headers(&mut self, ctx: &Context) -> &HashMap<String, String> {
        &self.populate(ctx).headers
    }

    /// One header's decoded value, empty if absent. Lookup name is
    /// case-insensitive.
    pub fn header(&mut self, ctx: &Context, name: &str) -> String {
        let name = name.to_lowercase();
        self.populate(ctx)
            .headers
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    /// The message's MIME tree, built on first access.
    pub fn parts(&mut self, ctx: &Context) -> &PartTree {
        &self.populate(ctx).parts
    }

    /// Drop the cached headers and part tree so the next access reparses.
    pub fn invalidate_cache(&mut self) {
        self.parsed = None;
    }

    fn populate(&mut self, ctx: &Context) -> &ParsedMail {
        if self.parsed.is_none() {
            let parsed = match self.load_and_parse(ctx) {
                Ok(parsed) => parsed,
                Err(e) => {
                    ctx.hooks
                        .report(&format!("failed to parse message {}: {}", self.path, e));
                    ParsedMail::default()
                }
            };
            self.parsed = Some(parsed);
        }
        self.parsed.get_or_insert_with(ParsedMail::default)
    }

    fn load_and_parse(&self, ctx: &Context) -> Result<ParsedMail> {
        self.fetch_body(ctx)?;

        // The host may substitute an alternate file to parse; if it does,
        // that file is temporary and gets deleted afterwards.
        let (file, replaced) = match ctx.hooks.rewrite(Path::new(&self.path)) {
            Some(alt) => (alt, true),
            None => (PathBuf::from(&self.path), false),
        };

        let bytes = fs::read(&file);
        if replaced {
            let _ = fs::remove_file(&file);
        }

        let bytes = bytes.with_context(|| format!("reading {}", file.display()))?;
        parse_bytes(&bytes, ctx.config.convert_charsets).ok_or_else(|| anyhow!("malformed MIME"))
    }

    /// Make sure a remote message's body exists in its local cache file,
    /// fetching it over the proxy on first access. Cached content is never
    /// re-fetched.
    fn fetch_body(&self, ctx: &Context) -> Result<()> {
        let Backend::Remote { id } = self.backend else {
            return Ok(());
        };

        if Path::new(&self.path).exists() {
            return Ok(());
        }

        let reply = ctx.proxy_send(&format!("get_message {} {}", id, self.parent_folder()))?;

        if let Some(dir) = Path::new(&self.path).parent() {
            fs::create_dir_all(dir)?;
        }
        let mut cache = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        cache.write_all(reply.as_bytes())?;

        Ok(())
    }

    /// Last modification time: filesystem mtime for local messages (1 when
    /// unreadable), the revision counter for remote ones.
    pub fn mtime(&self) -> i64 {
        match self.backend {
            Backend::Local => fs::metadata(&self.path)
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(1),
            Backend::Remote { .. } => self.revision as i64,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    // ------------------------------------------------------------------
    // Attachment addition
    // ------------------------------------------------------------------

    /// Wrap the message's body in a `multipart/mixed` container and append
    /// the named files as base64 attachments, rewriting the file on disk.
    ///
    /// Caller contract: the message must currently have exactly one
    /// top-level body part. The rewrite goes through a temp file and then
    /// replaces the original's content, keeping the maildir filename.
    pub fn add_attachments(&mut self, ctx: &Context, attachments: &[PathBuf]) -> Result<()> {
        if attachments.is_empty() {
            return Ok(());
        }

        let raw = fs::read(&self.path).with_context(|| format!("reading {}", self.path))?;
        let message = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| anyhow!("could not parse {}", self.path))?;
        let root = message
            .parts
            .first()
            .ok_or_else(|| anyhow!("message has no body"))?;

        // Everything except the MIME framing headers survives verbatim;
        // the new multipart container brings its own.
        let mut out = Vec::new();
        for header in &root.headers {
            if matches!(
                header.name,
                HeaderName::ContentType
                    | HeaderName::ContentTransferEncoding
                    | HeaderName::MimeVersion
            ) {
                continue;
            }
            out.extend_from_slice(header.name.as_str().as_bytes());
            out.push(b':');
            out.extend_from_slice(
                raw.get(header.offset_start..header.offset_end)
                    .unwrap_or_default(),
            );
        }
        out.extend_from_slice(b"MIME-Version: 1.0\r\n");

        // The existing body becomes the first child, re-typed text/plain
        // just like the original client does.
        let body_text = match &root.body {
            PartType::Text(text) | PartType::Html(text) => text.to_string(),
            PartType::Binary(data) | PartType::InlineBinary(data) => {
                String::from_utf8_lossy(data).into_owned()
            }
            _ => String::new(),
        };

        let mut children = vec![MimePart::new(ContentType::new("text/plain"), body_text)];
        for file in attachments {
            let bytes =
                fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let ctype = mime_guess::from_path(file)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            children.push(MimePart::new(ContentType::new(ctype), bytes).attachment(name));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&ctx.config.tmp_dir)?;
        tmp.write_all(&out)?;
        MimePart::new(ContentType::new("multipart/mixed"), children).write_part(&mut tmp)?;
        tmp.flush()?;

        // Replace content rather than renaming over the source; the temp
        // file is discarded when it drops.
        fs::copy(tmp.path(), &self.path)?;

        self.invalidate_cache();
        Ok(())
    }
}

/// Sorted, deduplicated, uppercase flag string.
pub fn canonicalize_flags(flags: &str) -> String {
    let mut chars: Vec<char> = flags.chars().map(|c| c.to_ascii_uppercase()).collect();
    chars.sort_unstable();
    chars.dedup();
    chars.into_iter().collect()
}

/// Flags parsed from a path's `:2,` suffix, raw.
fn suffix_flags(path: &str) -> String {
    match path.rfind(":2,") {
        Some(pos) => path[pos + 3..].to_string(),
        None => String::new(),
    }
}

/// The path with its `:2,` suffix replaced (or appended) to carry `flags`.
fn with_flag_suffix(path: &str, flags: &str) -> String {
    match path.rfind(":2,") {
        Some(pos) => format!("{}:2,{}", &path[..pos], flags),
        None => format!("{}:2,{}", path, flags),
    }
}
