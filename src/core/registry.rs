//! Purpose: Process-scope table of live contexts keyed by small integer ids.
//! Exports: `ContextRegistry`.
//! Invariants: Ids are unique among live contexts; a destroyed id is reused only
//! after every request it owned has received its terminal payload.
//! Invariants: Lookups never observe a half-destroyed context.
use super::context::Context;
use super::error::{Error, ErrorKind};
use super::function::FunctionTable;
use super::slots::{SlotKey, SlotTable};
use bytes::Bytes;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

pub struct ContextRegistry {
    table: RwLock<SlotTable<Arc<Context>>>,
}

impl ContextRegistry {
    pub fn new(max_contexts: u32) -> Self {
        Self {
            table: RwLock::new(SlotTable::with_capacity_limit(max_contexts)),
        }
    }

    pub fn create(&self, config: Bytes, functions: Arc<FunctionTable>) -> Result<Arc<Context>, Error> {
        let mut table = self.write();
        let key = table
            .insert_with(|key| Arc::new(Context::new(key, config, functions)))
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("context limit reached")
                    .with_hint("Destroy unused contexts or raise max_contexts.")
            })?;
        let context = table
            .get_key(key)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("context vanished"))?;
        tracing::info!(context = key.id, generation = key.generation, "context created");
        Ok(context)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Context>> {
        self.read().get(id).map(|(context, _)| context.clone())
    }

    pub fn get_key(&self, key: SlotKey) -> Option<Arc<Context>> {
        self.read().get_key(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.read().values().map(|context| context.id()).collect()
    }

    /// Tears a context down. Unknown ids are a no-op and return false.
    pub fn destroy(&self, id: u32) -> bool {
        let Some(context) = self.write().retire(id) else {
            tracing::debug!(context = id, "destroy of unknown context ignored");
            return false;
        };
        self.teardown(&context);
        self.write().reclaim(id);
        true
    }

    /// Like `destroy`, but only if `key` still names the live occupant.
    pub fn destroy_key(&self, key: SlotKey) -> bool {
        let context = {
            let mut table = self.write();
            if table.get_key(key).is_none() {
                return false;
            }
            table.retire(key.id)
        };
        let Some(context) = context else {
            return false;
        };
        self.teardown(&context);
        self.write().reclaim(key.id);
        true
    }

    fn teardown(&self, context: &Context) {
        let pending = context.close();
        let cancelled = pending.len();
        for entry in pending {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
            let reason = Error::new(ErrorKind::ContextDestroyed)
                .with_context_id(context.id())
                .with_request_id(entry.delivery.request_id());
            tracing::debug!(
                context = context.id(),
                request_id = entry.delivery.request_id(),
                "forcing terminal on destroy"
            );
            entry.delivery.cancel(&reason);
        }
        tracing::info!(context = context.id(), cancelled, "context destroyed");
    }

    fn read(&self) -> RwLockReadGuard<'_, SlotTable<Arc<Context>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotTable<Arc<Context>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
