//! Entity hierarchy cache
//!
//! The entity forest changes rarely but is consulted on almost every
//! request (scoping, routing, labels). The whole table is loaded into an
//! immutable tree snapshot cached with a TTL; mutations through the API
//! invalidate the snapshot so the next read rebuilds it.

use moka::future::Cache;
use sirena_common::db::models::Entite;
use sirena_common::Result;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Immutable snapshot of the entity forest
#[derive(Debug, Default)]
pub struct EntiteTree {
    by_id: HashMap<String, Entite>,
    children: HashMap<String, Vec<String>>,
    by_code: HashMap<String, String>,
    ordered: Vec<String>,
}

impl EntiteTree {
    pub fn build(entites: Vec<Entite>) -> Self {
        let mut tree = Self::default();

        for entite in &entites {
            tree.ordered.push(entite.id.clone());
            if let Some(code) = &entite.code {
                tree.by_code
                    .insert(code.trim().to_lowercase(), entite.id.clone());
            }
        }
        for entite in entites {
            tree.by_id.insert(entite.id.clone(), entite);
        }
        for entite in tree.by_id.values() {
            if let Some(parent_id) = &entite.parent_id {
                // A parent_id pointing nowhere makes the entity a root
                if tree.by_id.contains_key(parent_id) {
                    tree.children
                        .entry(parent_id.clone())
                        .or_default()
                        .push(entite.id.clone());
                }
            }
        }

        tree
    }

    pub fn get(&self, id: &str) -> Option<&Entite> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Label for display, `None` when the id is unknown
    pub fn label(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(|e| e.label.as_str())
    }

    /// Case-insensitive lookup by routing code
    pub fn find_by_code(&self, code: &str) -> Option<&Entite> {
        let id = self.by_code.get(&code.trim().to_lowercase())?;
        self.by_id.get(id)
    }

    /// All entities in listing order
    pub fn all(&self) -> Vec<&Entite> {
        self.ordered
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .collect()
    }

    /// The id plus every descendant id, breadth first
    ///
    /// An unknown id yields just itself: a user scoped on a deleted entity
    /// sees nothing rather than everything.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut result = vec![id.to_string()];
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(id);

        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children.get(current) {
                for child in children {
                    if seen.insert(child.as_str()) {
                        result.push(child.clone());
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        result
    }

    /// True when `candidate` equals `ancestor` or sits below it
    pub fn is_within(&self, ancestor: &str, candidate: &str) -> bool {
        if ancestor == candidate {
            return true;
        }

        let mut current = self.by_id.get(candidate).and_then(|e| e.parent_id.as_deref());
        let mut hops = 0;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            // Bounded in case a hand-edited database contains a cycle
            hops += 1;
            if hops > self.by_id.len() {
                return false;
            }
            current = self.by_id.get(parent).and_then(|e| e.parent_id.as_deref());
        }

        false
    }
}

/// TTL cache over the entity tree snapshot
#[derive(Clone)]
pub struct EntiteCache {
    db: SqlitePool,
    tree: Cache<(), Arc<EntiteTree>>,
}

impl EntiteCache {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        let tree = Cache::builder().max_capacity(1).time_to_live(ttl).build();

        Self { db, tree }
    }

    /// Current snapshot, loading from the database on miss
    pub async fn tree(&self) -> Result<Arc<EntiteTree>> {
        if let Some(tree) = self.tree.get(&()).await {
            return Ok(tree);
        }

        let entites = sqlx::query_as::<_, Entite>("SELECT * FROM entites ORDER BY nom")
            .fetch_all(&self.db)
            .await?;

        tracing::debug!(count = entites.len(), "Rebuilding entity tree snapshot");

        let tree = Arc::new(EntiteTree::build(entites));
        self.tree.insert((), tree.clone()).await;
        Ok(tree)
    }

    /// Drop the snapshot after a mutation
    pub fn invalidate(&self) {
        self.tree.invalidate_all();
    }
}
