use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::Context;
use crate::mail::message::{Message, MessageRef};

/// A folder of messages: a maildir on disk, or a remote folder whose
/// listing the proxy pushes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaildirKind {
    Local,
    Remote,
}

/// One message row from a remote folder listing.
pub struct RemoteEntry {
    pub id: u32,
    pub flags: String,
}

/// A mail folder. Local folders lazily rescan when the directory mtime
/// moves; remote folders hold whatever listing was last installed, with a
/// synthetic mtime counter standing in for the filesystem's.
pub struct Maildir {
    path: String,
    kind: MaildirKind,
    messages: RefCell<Vec<MessageRef>>,
    scanned_mtime: Cell<i64>,
    unread: Cell<usize>,
    total: Cell<usize>,
    /// Handed to scanned messages as their parent back-reference.
    weak_self: Weak<Maildir>,
}

impl Maildir {
    pub fn local(path: impl Into<String>) -> Rc<Self> {
        Self::build(path.into(), MaildirKind::Local, -1)
    }

    /// A remote folder named by its server-side path (for example `INBOX`).
    pub fn remote(folder: impl Into<String>) -> Rc<Self> {
        Self::build(folder.into(), MaildirKind::Remote, 0)
    }

    fn build(path: String, kind: MaildirKind, initial_mtime: i64) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            path,
            kind,
            messages: RefCell::new(Vec::new()),
            scanned_mtime: Cell::new(initial_mtime),
            unread: Cell::new(0),
            total: Cell::new(0),
            weak_self: weak.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_local(&self) -> bool {
        self.kind == MaildirKind::Local
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    /// Whether a directory looks like a maildir: `new/`, `cur/` and `tmp/`
    /// all present.
    pub fn is_maildir(path: &Path) -> bool {
        ["new", "cur", "tmp"].iter().all(|s| path.join(s).is_dir())
    }

    /// Walk `root` and collect every maildir beneath it, sorted by path.
    pub fn discover(root: &Path) -> Vec<Rc<Maildir>> {
        let mut found: Vec<Rc<Maildir>> = WalkDir::new(root)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_dir() && Self::is_maildir(e.path()))
            .map(|e| Self::local(e.path().to_string_lossy().into_owned()))
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }

    pub fn total_messages(&self) -> usize {
        self.total.get()
    }

    pub fn unread_messages(&self) -> usize {
        self.unread.get()
    }

    pub(crate) fn set_unread(&self, n: usize) {
        self.unread.set(n);
    }

    /// The change signal consumers compare against: the newest mtime of
    /// `new/` and `cur/` for local folders, the bump counter for remote.
    pub fn mtime(&self) -> i64 {
        match self.kind {
            MaildirKind::Local => self.live_mtime(),
            MaildirKind::Remote => self.scanned_mtime.get(),
        }
    }

    /// Record that something changed remotely so watchers rescan.
    pub fn bump_mtime(&self) {
        if self.is_remote() {
            self.scanned_mtime.set(self.scanned_mtime.get() + 1);
        }
    }

    fn live_mtime(&self) -> i64 {
        ["new", "cur"]
            .iter()
            .filter_map(|s| fs::metadata(Path::new(&self.path).join(s)).ok())
            .filter_map(|m| m.modified().ok())
            .filter_map(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .max()
            .unwrap_or(0)
    }

    /// The folder's messages. Local folders rescan when the directory has
    /// changed since the last scan; remote folders return the installed
    /// listing as-is.
    pub fn messages(&self, ctx: &Context) -> Vec<MessageRef> {
        if self.is_local() && self.scanned_mtime.get() != self.live_mtime() {
            self.scan(ctx);
        }
        self.messages.borrow().clone()
    }

    fn scan(&self, _ctx: &Context) {
        let mut found = Vec::new();
        let mut unread = 0;

        for sub in ["cur", "new"] {
            let dir = Path::new(&self.path).join(sub);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            paths.sort();

            for path in paths {
                let mut msg = Message::local(path.to_string_lossy().into_owned());
                msg.set_parent(self.weak_self.clone());
                if msg.is_new() {
                    unread += 1;
                }
                found.push(Rc::new(RefCell::new(msg)));
            }
        }

        self.total.set(found.len());
        self.unread.set(unread);
        *self.messages.borrow_mut() = found;
        self.scanned_mtime.set(self.live_mtime());
    }

    /// Replace a remote folder's contents with a fresh listing. Each entry
    /// gets a body-cache path under the configured cache directory.
    pub fn install_remote_listing(&self, ctx: &Context, entries: Vec<RemoteEntry>) {
        let folder_dir = self.path.replace('/', "_");
        let mut found = Vec::new();
        let mut unread = 0;

        for entry in entries {
            let cache = Path::new(&ctx.config.cache_dir)
                .join(&folder_dir)
                .join(entry.id.to_string());
            let mut msg = Message::remote(
                entry.id,
                cache.to_string_lossy().into_owned(),
                &entry.flags,
            );
            msg.set_parent(self.weak_self.clone());
            if msg.is_new() {
                unread += 1;
            }
            found.push(Rc::new(RefCell::new(msg)));
        }

        self.total.set(found.len());
        self.unread.set(unread);
        *self.messages.borrow_mut() = found;
        self.bump_mtime();
    }

    /// Drop a deleted message from the cached list and fix the counters.
    /// The target is named by address so it can be found while the caller
    /// still holds it borrowed.
    pub(crate) fn forget(&self, target: *const Message, was_new: bool) {
        let mut messages = self.messages.borrow_mut();
        let before = messages.len();
        messages.retain(|m| !std::ptr::eq(m.as_ptr(), target));
        if messages.len() < before {
            self.total.set(messages.len());
            if was_new {
                self.unread.set(self.unread.get().saturating_sub(1));
            }
        }
    }
}
