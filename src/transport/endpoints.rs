//! YouTube Data API v3 live chat endpoints and quota costs
//!
//! Every call is charged against the project's daily quota:
//!
//! | Operation | Cost |
//! |---|---|
//! | `liveChatMessages.list` | 5 |
//! | `liveChatMessages.insert` / `.delete` | 50 |
//! | `liveChatBans.insert` / `.delete` | 50 |
//! | `liveChatModerators.insert` / `.delete` | 50 |

use super::Mutation;

/// Base URL of the Data API
pub const BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Chat messages collection (list, insert, delete)
pub const MESSAGES_PATH: &str = "/liveChat/messages";

/// Chat bans collection (insert, delete)
pub const BANS_PATH: &str = "/liveChat/bans";

/// Chat moderators collection (insert, delete)
pub const MODERATORS_PATH: &str = "/liveChat/moderators";

/// Resource parts requested when listing messages
pub const MESSAGE_PARTS: &str = "id,snippet,authorDetails";

/// Page size requested when listing messages (API maximum)
pub const MAX_RESULTS: u32 = 2000;

/// Quota cost of one `liveChatMessages.list` call
pub const FETCH_COST: u64 = 5;

/// Quota cost of any insert or delete
pub const WRITE_COST: u64 = 50;

/// Quota cost of `mutation`
pub fn mutation_cost(mutation: &Mutation) -> u64 {
    match mutation {
        Mutation::SendMessage { .. }
        | Mutation::DeleteMessage { .. }
        | Mutation::Ban { .. }
        | Mutation::Timeout { .. }
        | Mutation::Unban { .. }
        | Mutation::AddModerator { .. }
        | Mutation::RemoveModerator { .. } => WRITE_COST,
    }
}

/// Collection path a mutation targets
pub fn mutation_path(mutation: &Mutation) -> &'static str {
    match mutation {
        Mutation::SendMessage { .. } | Mutation::DeleteMessage { .. } => MESSAGES_PATH,
        Mutation::Ban { .. } | Mutation::Timeout { .. } | Mutation::Unban { .. } => BANS_PATH,
        Mutation::AddModerator { .. } | Mutation::RemoveModerator { .. } => MODERATORS_PATH,
    }
}
