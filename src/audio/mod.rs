pub mod autoplaylist;
pub(crate) mod connection;
pub mod player;
pub mod queue;
pub mod votes;

pub use autoplaylist::AutoplaylistManager;
pub use player::{GuildPlayer, PlayerHandle, PlayerNotification, PlayerState};
pub use queue::{EnqueueMode, Entry, QueuePage, TrackQueue};
pub use votes::{SkipVoteTracker, VoteOutcome};
