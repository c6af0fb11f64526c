#![forbid(unsafe_code)]

//! In-memory host: a catalog of databases and relations backed by a
//! [`BufferPool`].
//!
//! Relations have a stable logical id and a physical object id that changes
//! when the relation is rewritten, which is what makes stale save-file
//! entries resolve to nothing.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::hibernate::{
    DatabaseNames, RelationReader, ResidentPages, RestoreSession, SessionFactory,
};
use crate::primitives::pool::{BufferPool, Fetch, PoolOptions, PoolStats};
use crate::types::{
    DatabaseId, ForkNumber, HibernateError, ObjectId, PageNo, PageTag, RelationId, Result,
};

const RESOLVE_CACHE_ENTRIES: usize = 256;

#[derive(Clone, Debug)]
struct RelationEntry {
    object: ObjectId,
    forks: BTreeMap<ForkNumber, u32>,
}

#[derive(Debug, Default)]
struct Catalog {
    names: BTreeMap<DatabaseId, String>,
    /// Keyed by owning database; shared relations live under
    /// [`DatabaseId::GLOBAL`].
    relations: HashMap<(DatabaseId, RelationId), RelationEntry>,
    objects: HashMap<(DatabaseId, ObjectId), RelationId>,
}

impl Catalog {
    fn database_id(&self, name: &str) -> Option<DatabaseId> {
        self.names
            .iter()
            .find(|(id, n)| !id.is_global() && n.as_str() == name)
            .map(|(id, _)| *id)
    }

    fn relation_mut(
        &mut self,
        database: DatabaseId,
        relation: RelationId,
    ) -> Result<&mut RelationEntry> {
        self.relations
            .get_mut(&(database, relation))
            .ok_or_else(|| HibernateError::NotFound(format!("relation {}", relation.0)))
    }
}

struct HostState {
    catalog: RwLock<Catalog>,
    pool: BufferPool,
}

impl HostState {
    fn fill_page(tag: PageTag, buf: &mut [u8]) {
        let stamp = [
            tag.database.0.to_be_bytes(),
            tag.object.0.to_be_bytes(),
            tag.fork.0.to_be_bytes(),
            tag.page.0.to_be_bytes(),
        ]
        .concat();
        for (dst, src) in buf.iter_mut().zip(stamp.iter().cycle()) {
            *dst = *src;
        }
    }
}

/// Reference host used by the CLI demo, the tests, and the benchmark.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<HostState>,
}

impl MemoryHost {
    /// Creates a host with an empty catalog and pool.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            state: Arc::new(HostState {
                catalog: RwLock::new(Catalog::default()),
                pool: BufferPool::new(options),
            }),
        }
    }

    /// Registers a database.
    pub fn add_database(&self, id: DatabaseId, name: &str) -> Result<()> {
        if id.is_global() {
            return Err(HibernateError::Invalid("database id 0 is reserved"));
        }
        let mut catalog = self.state.catalog.write();
        if catalog.database_id(name).is_some_and(|existing| existing != id) {
            return Err(HibernateError::Invalid("database name already in use"));
        }
        catalog.names.insert(id, name.to_string());
        Ok(())
    }

    /// Removes a database's name. Its relations stay, which leaves their
    /// resident pages without a resolvable owner name.
    pub fn forget_database(&self, id: DatabaseId) {
        self.state.catalog.write().names.remove(&id);
    }

    /// Creates a relation owned by `database` (or shared, for
    /// [`DatabaseId::GLOBAL`]) stored under `object`.
    pub fn create_relation(
        &self,
        database: DatabaseId,
        relation: RelationId,
        object: ObjectId,
    ) -> Result<()> {
        let mut catalog = self.state.catalog.write();
        if catalog.objects.contains_key(&(database, object)) {
            return Err(HibernateError::Invalid("object id already in use"));
        }
        // Sessions open relations by id alone, so a shared relation id must
        // not also name a relation in any database.
        let taken = if database.is_global() {
            catalog.relations.keys().any(|(_, id)| *id == relation)
        } else {
            catalog.relations.contains_key(&(database, relation))
                || catalog
                    .relations
                    .contains_key(&(DatabaseId::GLOBAL, relation))
        };
        if taken {
            return Err(HibernateError::Invalid("relation id already in use"));
        }
        catalog.relations.insert(
            (database, relation),
            RelationEntry {
                object,
                forks: BTreeMap::new(),
            },
        );
        catalog.objects.insert((database, object), relation);
        Ok(())
    }

    /// Creates or resizes a fork.
    pub fn set_fork_len(
        &self,
        database: DatabaseId,
        relation: RelationId,
        fork: ForkNumber,
        pages: u32,
    ) -> Result<()> {
        let mut catalog = self.state.catalog.write();
        catalog
            .relation_mut(database, relation)?
            .forks
            .insert(fork, pages);
        Ok(())
    }

    /// Removes a fork.
    pub fn drop_fork(
        &self,
        database: DatabaseId,
        relation: RelationId,
        fork: ForkNumber,
    ) -> Result<()> {
        let mut catalog = self.state.catalog.write();
        catalog.relation_mut(database, relation)?.forks.remove(&fork);
        Ok(())
    }

    /// Moves a relation to a new physical object, as a table rewrite does.
    pub fn rewrite_relation(
        &self,
        database: DatabaseId,
        relation: RelationId,
        object: ObjectId,
    ) -> Result<()> {
        let mut catalog = self.state.catalog.write();
        if catalog.objects.contains_key(&(database, object)) {
            return Err(HibernateError::Invalid("object id already in use"));
        }
        let entry = catalog.relation_mut(database, relation)?;
        let old = std::mem::replace(&mut entry.object, object);
        catalog.objects.remove(&(database, old));
        catalog.objects.insert((database, object), relation);
        debug!(relation = relation.0, from = old.0, to = object.0, "memory.rewrite");
        Ok(())
    }

    /// Drops a relation.
    pub fn drop_relation(&self, database: DatabaseId, relation: RelationId) -> Result<()> {
        let mut catalog = self.state.catalog.write();
        let entry = catalog
            .relations
            .remove(&(database, relation))
            .ok_or_else(|| HibernateError::NotFound(format!("relation {}", relation.0)))?;
        catalog.objects.remove(&(database, entry.object));
        Ok(())
    }

    /// Reads pages `pages` of a fork through the pool, as a workload would.
    pub fn read_pages(
        &self,
        database: DatabaseId,
        relation: RelationId,
        fork: ForkNumber,
        pages: impl IntoIterator<Item = u32>,
    ) -> Result<()> {
        let reader = MemoryRelation::open(&self.state, database, relation)?;
        for page in pages {
            reader.load_page(fork, PageNo(page))?;
        }
        Ok(())
    }

    /// Empties the pool, as a restart would.
    pub fn restart(&self) {
        self.state.pool.clear();
    }

    /// The pool.
    pub fn pool(&self) -> &BufferPool {
        &self.state.pool
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.state.pool.stats()
    }
}

impl ResidentPages for MemoryHost {
    fn resident_pages(&self) -> Vec<PageTag> {
        self.state.pool.resident_pages()
    }
}

impl DatabaseNames for MemoryHost {
    fn database_name(&self, database: DatabaseId) -> Option<String> {
        self.state.catalog.read().names.get(&database).cloned()
    }
}

impl SessionFactory for MemoryHost {
    fn connect(&self, database: &str) -> Result<Box<dyn RestoreSession>> {
        let id = self
            .state
            .catalog
            .read()
            .database_id(database)
            .ok_or_else(|| HibernateError::NotFound(format!("database {database:?}")))?;
        let capacity = NonZeroUsize::new(RESOLVE_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            database: id,
            resolved: LruCache::new(capacity),
        }))
    }
}

/// Restore session bound to one database.
struct MemorySession {
    state: Arc<HostState>,
    database: DatabaseId,
    resolved: LruCache<ObjectId, Option<RelationId>>,
}

impl MemorySession {
    fn lookup(&self, object: ObjectId) -> Option<RelationId> {
        let catalog = self.state.catalog.read();
        [self.database, DatabaseId::GLOBAL]
            .into_iter()
            .find_map(|owner| catalog.objects.get(&(owner, object)).copied())
    }
}

impl RestoreSession for MemorySession {
    fn resolve(&mut self, object: ObjectId) -> Result<Option<RelationId>> {
        if let Some(hit) = self.resolved.get(&object) {
            return Ok(*hit);
        }
        let found = self.lookup(object);
        self.resolved.put(object, found);
        Ok(found)
    }

    fn open_relation(&mut self, relation: RelationId) -> Result<Box<dyn RelationReader>> {
        let owner = if self
            .state
            .catalog
            .read()
            .relations
            .contains_key(&(self.database, relation))
        {
            self.database
        } else {
            DatabaseId::GLOBAL
        };
        Ok(Box::new(MemoryRelation::open(&self.state, owner, relation)?))
    }
}

struct MemoryRelation {
    state: Arc<HostState>,
    database: DatabaseId,
    relation: RelationId,
    object: ObjectId,
}

impl MemoryRelation {
    fn open(state: &Arc<HostState>, database: DatabaseId, relation: RelationId) -> Result<Self> {
        let object = state
            .catalog
            .read()
            .relations
            .get(&(database, relation))
            .map(|entry| entry.object)
            .ok_or_else(|| HibernateError::NotFound(format!("relation {}", relation.0)))?;
        Ok(Self {
            state: Arc::clone(state),
            database,
            relation,
            object,
        })
    }

    fn fork(&self, fork: ForkNumber) -> Option<u32> {
        self.state
            .catalog
            .read()
            .relations
            .get(&(self.database, self.relation))
            .and_then(|entry| entry.forks.get(&fork).copied())
    }
}

impl RelationReader for MemoryRelation {
    fn fork_exists(&self, fork: ForkNumber) -> Result<bool> {
        Ok(self.fork(fork).is_some())
    }

    fn fork_len(&self, fork: ForkNumber) -> Result<u32> {
        Ok(self.fork(fork).unwrap_or(0))
    }

    fn load_page(&self, fork: ForkNumber, page: PageNo) -> Result<()> {
        let len = self
            .fork(fork)
            .ok_or_else(|| HibernateError::NotFound(format!("fork {}", fork.0)))?;
        if page.0 >= len {
            return Err(HibernateError::Invalid("page beyond end of fork"));
        }
        let tag = PageTag {
            database: self.database,
            object: self.object,
            fork,
            page,
        };
        let outcome = self.state.pool.fetch(tag, |buf| {
            HostState::fill_page(tag, buf);
            Ok(())
        })?;
        if outcome == Fetch::Miss {
            trace!(page = %tag, "memory.load");
        }
        Ok(())
    }
}
