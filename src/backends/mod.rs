//! Concrete [`SearchBackend`](crate::search::SearchBackend) implementations.

pub mod lavalink;
pub mod ytdlp;

pub use lavalink::LavalinkSearch;
pub use ytdlp::YtDlpSearch;
