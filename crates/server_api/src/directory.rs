use shared::{
    domain::UserId,
    error::ApiError,
    protocol::UserSummary,
};

use crate::{internal, user_summary, ApiContext};

const DIRECTORY_RESULT_LIMIT: u32 = 25;
const MIN_QUERY_CHARS: usize = 2;

/// Name search over active accounts. Patients only show up when the
/// caller asks for them; admin accounts never do. Queries under two
/// characters return nothing rather than the whole directory.
pub async fn search_directory(
    ctx: &ApiContext,
    caller: UserId,
    query: &str,
    include_patients: bool,
) -> Result<Vec<UserSummary>, ApiError> {
    let query = query.trim();
    if query.chars().count() < MIN_QUERY_CHARS {
        return Ok(Vec::new());
    }
    let users = ctx
        .storage
        .search_directory(caller, query, include_patients, DIRECTORY_RESULT_LIMIT)
        .await
        .map_err(internal)?;
    Ok(users.into_iter().map(user_summary).collect())
}
