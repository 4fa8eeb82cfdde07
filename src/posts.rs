//! Raw posts and request payloads.
//!
//! Historical posts arrive as a JSON-lines dump, one submission per line, in
//! the shape the moderation backend stores them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};

/// Neighbors requested when a caller does not say.
pub const DEFAULT_K: usize = 10;

/// Inverted lists probed when a caller does not say.
pub const DEFAULT_SEARCH_BREADTH: usize = 2;

fn default_k() -> usize {
    DEFAULT_K
}

fn default_search_breadth() -> usize {
    DEFAULT_SEARCH_BREADTH
}

/// One historical submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPost {
    #[serde(alias = "id")]
    pub submission_id: String,
    #[serde(default, alias = "title")]
    pub submission_title: String,
    #[serde(default, alias = "selftext")]
    pub submission_text: String,
    pub subreddit: String,
}

/// Request to score one post against one subreddit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSimilarityRequest {
    pub post_title: String,
    #[serde(default)]
    pub post_text: String,
    pub subreddit: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_search_breadth", alias = "nprobe")]
    pub search_breadth: usize,
}

/// Request to score one post against several subreddits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubredditFitRequest {
    pub post_title: String,
    #[serde(default)]
    pub post_text: String,
    pub subreddits: Vec<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_search_breadth", alias = "nprobe")]
    pub search_breadth: usize,
}

/// Reads a JSON-lines dump of posts. Blank lines are skipped.
///
/// # Errors
/// `Io` if the file cannot be read, `InvalidInput` naming the first
/// malformed line.
pub fn read_posts_jsonl(path: &Path) -> IndexResult<Vec<RawPost>> {
    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut posts = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| IndexError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let post: RawPost = serde_json::from_str(&line).map_err(|e| IndexError::InvalidInput {
            reason: format!("{}:{}: {e}", path.display(), line_no + 1),
        })?;
        posts.push(post);
    }

    debug!(path = %path.display(), posts = posts.len(), "read post dump");
    Ok(posts)
}

/// Groups posts by subreddit, keeping the order of first appearance and the
/// order of posts within each group.
///
/// With a non-empty `only`, groups come back in that order and requested
/// subreddits without posts are skipped with a warning.
pub fn group_by_subreddit(posts: Vec<RawPost>, only: &[String]) -> Vec<(String, Vec<RawPost>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<RawPost>> = HashMap::new();
    for post in posts {
        if !groups.contains_key(&post.subreddit) {
            order.push(post.subreddit.clone());
        }
        groups.entry(post.subreddit.clone()).or_default().push(post);
    }

    if only.is_empty() {
        return order
            .into_iter()
            .filter_map(|name| groups.remove(&name).map(|posts| (name, posts)))
            .collect();
    }

    let mut selected = Vec::with_capacity(only.len());
    for name in only {
        match groups.remove(name) {
            Some(posts) => selected.push((name.clone(), posts)),
            None => warn!(subreddit = %name, "no posts found, skipping"),
        }
    }
    selected
}
