pub mod maildir;
pub mod message;
pub mod part;
pub mod threading;

pub use maildir::{Maildir, MaildirKind, RemoteEntry};
pub use message::{Backend, Message, MessageRef};
pub use part::{ParsedMail, Part, PartTree};
pub use threading::{Forest, ThreadEntry};
