//! Build-and-publish pipeline for a subreddit's post history.

use std::path::PathBuf;

use tracing::info;

use crate::error::IndexResult;
use crate::posts::RawPost;
use crate::vector::{Embedder, IndexBuilder, IndexCache, IndexStamp, IndexStore};

/// Posts embedded per model call unless configured otherwise.
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 256;

/// Summary of one published index.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub subreddit: String,
    pub documents: usize,
    pub nlist: usize,
    pub stamp: IndexStamp,
    pub path: PathBuf,
}

/// Embeds, builds and saves subreddit indexes, then evicts stale cache
/// entries so the next query loads the new build.
pub struct Publisher<'a> {
    builder: &'a IndexBuilder,
    embedder: &'a dyn Embedder,
    store: &'a IndexStore,
    cache: Option<&'a IndexCache>,
    batch_size: usize,
}

impl<'a> Publisher<'a> {
    pub fn new(builder: &'a IndexBuilder, embedder: &'a dyn Embedder, store: &'a IndexStore) -> Self {
        Self {
            builder,
            embedder,
            store,
            cache: None,
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }

    /// Cache to evict from after each publish.
    pub fn with_cache(mut self, cache: &'a IndexCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Builds and publishes one subreddit. Nothing is written unless the
    /// build succeeds.
    ///
    /// `on_batch` receives the number of posts embedded so far.
    pub fn publish(
        &self,
        subreddit: &str,
        posts: &[RawPost],
        on_batch: impl FnMut(usize),
    ) -> IndexResult<BuildReport> {
        let built =
            self.builder
                .build_from_posts(self.embedder, subreddit, posts, self.batch_size, on_batch)?;
        let stamp = self.store.save(subreddit, &built.index, &built.ids)?;

        if let Some(cache) = self.cache {
            cache.evict(subreddit);
        }

        info!(
            subreddit,
            documents = built.ids.len(),
            nlist = built.index.nlist(),
            "published index"
        );

        Ok(BuildReport {
            subreddit: subreddit.to_string(),
            documents: built.ids.len(),
            nlist: built.index.nlist(),
            stamp,
            path: self.store.index_path_for(subreddit, &stamp),
        })
    }
}
