use std::path::{Path, PathBuf};

/// Consulted before a message file is opened for parsing. Returning
/// `Some(path)` substitutes an alternate file; if the hook created it as a
/// temporary file the caller deletes it after parsing.
pub type RewriteHook = Box<dyn Fn(&Path) -> Option<PathBuf>>;

/// Receives a human-readable description of a failure the host may want to
/// surface to the user.
pub type ErrorHook = Box<dyn Fn(&str)>;

/// Strategy interfaces supplied by the host (in the full client these are
/// backed by the scripting layer). Both are optional; absent hooks behave
/// as pass-through.
#[derive(Default)]
pub struct Hooks {
    rewrite: Option<RewriteHook>,
    on_error: Option<ErrorHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rewrite(&mut self, hook: RewriteHook) {
        self.rewrite = Some(hook);
    }

    pub fn set_on_error(&mut self, hook: ErrorHook) {
        self.on_error = Some(hook);
    }

    /// Ask the host for an alternate file to parse instead of `path`.
    pub fn rewrite(&self, path: &Path) -> Option<PathBuf> {
        self.rewrite.as_ref().and_then(|f| f(path))
    }

    /// Report a failure to the host, or log it if no hook is installed.
    pub fn report(&self, msg: &str) {
        match &self.on_error {
            Some(f) => f(msg),
            None => log::warn!("{}", msg),
        }
    }
}
