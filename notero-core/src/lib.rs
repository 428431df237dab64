//! # notero-core: shared state engine for a collaborative voting board
//!
//! Three last-write-wins replicated maps (users, notes, ballots), the
//! per-session identity, vote aggregation and a single change signal for
//! the presentation layer.
//!
//! ## Architecture
//!
//! ```text
//!  presentation ──create_note / toggle_vote──► BoardEngine
//!       ▲                                          │
//!       │ BoardChanged                             ▼
//!  ChangeNotifier ◄──MapChange── BoardStores { notes, ballots, users }
//!                                                  │  ▲
//!                                         publish  │  │ apply_remote / acknowledge
//!                                                  ▼  │
//!                                            Broadcaster (transport)
//! ```
//!
//! ## Modules
//!
//! - [`map`]: `ReplicatedMap`, `Delta`, the `Broadcaster` seam
//! - [`stores`]: the three board maps and delta routing
//! - [`identity`]: `IdentityManager` over an injected `SessionStore`
//! - [`session`]: `SessionStore` implementations (memory, JSON file)
//! - [`event`]: listener registry and `Subscription` handles
//! - [`board`]: `BoardEngine` commands and queries
//! - [`aggregate`]: pure vote aggregation
//! - [`notifier`]: one `BoardChanged` signal per map change
//! - [`loopback`]: in-process relay for tests and single-process use

pub mod aggregate;
pub mod board;
pub mod event;
pub mod identity;
pub mod loopback;
pub mod map;
pub mod model;
pub mod notifier;
pub mod session;
pub mod stores;

pub use aggregate::aggregate;
pub use board::BoardEngine;
pub use event::{EventHub, Subscription};
pub use identity::{IdentityManager, USER_ID_KEY};
pub use loopback::{LoopbackRelay, ReplicaId};
pub use map::{
    Broadcaster, ChangeKind, ChangeOrigin, Delta, MapChange, MapError, MapOp, ReplicatedMap,
};
pub use model::{AggregatedNote, Ballot, Note, User};
pub use notifier::{BoardChanged, ChangeNotifier};
pub use session::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError};
pub use stores::{BoardStores, StoreKind};
