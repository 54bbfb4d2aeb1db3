use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use wayfare_core::contracts::RunPersistence;
use wayfare_core::error::Result;
use wayfare_core::progress::RunProgress;
use wayfare_core::types::{RunId, UserContext};

/// Run store held entirely in memory.
///
/// `save_progress` only marks the aggregate dirty; `finalize_save` commits
/// dirty entries to the committed map. Loads read committed state, which
/// mirrors how a durable backend behaves across a crash: unflushed saves
/// are gone.
#[derive(Default)]
pub struct InMemoryRunStore {
    committed: Mutex<HashMap<RunId, (String, String)>>,
    dirty: Mutex<HashMap<RunId, (String, String)>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed runs, for assertions.
    pub fn committed_count(&self) -> usize {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether unflushed saves are pending.
    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl RunPersistence for InMemoryRunStore {
    fn load_progress<'a>(
        &'a self,
        run_id: &'a RunId,
        user: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<RunProgress>>> {
        Box::pin(async move {
            let committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
            let Some((owner_id, json)) = committed.get(run_id) else {
                return Ok(None);
            };
            if owner_id != &user.user_id {
                return Ok(None);
            }
            let progress: RunProgress = serde_json::from_str(json)?;
            Ok(Some(progress))
        })
    }

    fn save_progress<'a>(&'a self, run: &'a RunProgress) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(run)?;
            self.dirty
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(run.run_id.clone(), (run.owner.user_id.clone(), json));
            Ok(())
        })
    }

    fn finalize_save(&self, clear_cache: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
            for (run_id, entry) in dirty.iter() {
                committed.insert(run_id.clone(), entry.clone());
            }
            if clear_cache {
                dirty.clear();
            }
            Ok(())
        })
    }
}
