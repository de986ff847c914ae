//! Project tree nodes and node file registrations.
//!
//! Only the node CRUD pass-through and the idempotent node-file upsert are
//! part of the core contract. Node files deliberately have no foreign key to
//! jobs: deleting a job never unregisters its published artifacts.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

use crate::schema::{node_files, tree_nodes};
use crate::with_conn;

use super::pool::DbPool;
use super::records::{now_ts, parse_ts, NewNodeFile, NewTreeNode, NodeFileRecord, TreeNodeRecord};
use super::{RepoResult, RepositoryError};

/// A hierarchical project node (external contract; only id and files matter
/// to the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub node_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TreeNodeRecord> for TreeNode {
    fn from(r: TreeNodeRecord) -> Self {
        TreeNode {
            id: r.id,
            parent_id: r.parent_id,
            name: r.name,
            node_type: r.node_type,
            created_at: parse_ts(&r.created_at),
            updated_at: parse_ts(&r.updated_at),
        }
    }
}

/// A file registered at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFile {
    pub id: String,
    pub node_id: String,
    pub object_key: String,
    pub file_name: String,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<NodeFileRecord> for NodeFile {
    fn from(r: NodeFileRecord) -> Self {
        NodeFile {
            id: r.id,
            node_id: r.node_id,
            object_key: r.object_key,
            file_name: r.file_name,
            file_type: r.file_type,
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Clone)]
pub struct NodeRepository {
    pool: DbPool,
}

impl NodeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        parent_id: Option<&str>,
        name: &str,
        node_type: &str,
    ) -> RepoResult<TreeNode> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        with_conn!(self.pool, conn, {
            diesel::insert_into(tree_nodes::table)
                .values(NewTreeNode {
                    id: &id,
                    parent_id,
                    name,
                    node_type,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                })
                .execute(&mut conn)
                .await?;
            let record: TreeNodeRecord = tree_nodes::table
                .filter(tree_nodes::id.eq(&id))
                .first(&mut conn)
                .await?;
            Ok(record.into())
        })
    }

    pub async fn get(&self, id: &str) -> RepoResult<Option<TreeNode>> {
        with_conn!(self.pool, conn, {
            let record: Option<TreeNodeRecord> = tree_nodes::table
                .filter(tree_nodes::id.eq(id))
                .first(&mut conn)
                .await
                .optional()?;
            Ok(record.map(TreeNode::from))
        })
    }

    /// Children of a node; root nodes when `parent_id` is None.
    pub async fn children(&self, parent_id: Option<&str>) -> RepoResult<Vec<TreeNode>> {
        with_conn!(self.pool, conn, {
            let mut query = tree_nodes::table.order(tree_nodes::name.asc()).into_boxed();
            query = match parent_id {
                Some(parent) => query.filter(tree_nodes::parent_id.eq(parent)),
                None => query.filter(tree_nodes::parent_id.is_null()),
            };
            let records: Vec<TreeNodeRecord> = query.load(&mut conn).await?;
            Ok(records.into_iter().map(TreeNode::from).collect())
        })
    }

    pub async fn rename(&self, id: &str, name: &str) -> RepoResult<TreeNode> {
        with_conn!(self.pool, conn, {
            let changed = diesel::update(tree_nodes::table.filter(tree_nodes::id.eq(id)))
                .set((tree_nodes::name.eq(name), tree_nodes::updated_at.eq(now_ts())))
                .execute(&mut conn)
                .await?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("node {}", id)));
            }
            let record: TreeNodeRecord = tree_nodes::table
                .filter(tree_nodes::id.eq(id))
                .first(&mut conn)
                .await?;
            Ok(record.into())
        })
    }

    /// Delete a node together with its file registrations.
    pub async fn delete(&self, id: &str) -> RepoResult<bool> {
        let id = id.to_string();
        let deleted = with_conn!(self.pool, conn, {
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                let id = id.clone();
                Box::pin(async move {
                    diesel::delete(node_files::table.filter(node_files::node_id.eq(&id)))
                        .execute(conn)
                        .await?;
                    diesel::delete(tree_nodes::table.filter(tree_nodes::id.eq(&id)))
                        .execute(conn)
                        .await
                })
            })
            .await?
        });
        Ok(deleted > 0)
    }

    /// Idempotent upsert keyed by (node_id, object_key). Re-registering the
    /// same artifact refreshes the name and type in place.
    pub async fn register_node_file(
        &self,
        node_id: &str,
        object_key: &str,
        file_name: &str,
        file_type: &str,
    ) -> RepoResult<NodeFile> {
        let node_id = node_id.to_string();
        let object_key = object_key.to_string();
        let file_name = file_name.to_string();
        let file_type = file_type.to_string();
        let record = with_conn!(self.pool, conn, {
            conn.transaction::<NodeFileRecord, diesel::result::Error, _>(|conn| {
                let node_id = node_id.clone();
                let object_key = object_key.clone();
                let file_name = file_name.clone();
                let file_type = file_type.clone();
                Box::pin(async move {
                    let existing: Option<NodeFileRecord> = node_files::table
                        .filter(node_files::node_id.eq(&node_id))
                        .filter(node_files::object_key.eq(&object_key))
                        .first(conn)
                        .await
                        .optional()?;

                    if let Some(existing) = existing {
                        diesel::update(node_files::table.filter(node_files::id.eq(&existing.id)))
                            .set((
                                node_files::file_name.eq(&file_name),
                                node_files::file_type.eq(&file_type),
                            ))
                            .execute(conn)
                            .await?;
                    } else {
                        let id = uuid::Uuid::new_v4().to_string();
                        diesel::insert_into(node_files::table)
                            .values(NewNodeFile {
                                id: &id,
                                node_id: &node_id,
                                object_key: &object_key,
                                file_name: &file_name,
                                file_type: &file_type,
                                created_at: now_ts(),
                            })
                            .execute(conn)
                            .await?;
                    }

                    node_files::table
                        .filter(node_files::node_id.eq(&node_id))
                        .filter(node_files::object_key.eq(&object_key))
                        .first(conn)
                        .await
                })
            })
            .await?
        });
        Ok(record.into())
    }

    pub async fn list_node_files(&self, node_id: &str) -> RepoResult<Vec<NodeFile>> {
        with_conn!(self.pool, conn, {
            let records: Vec<NodeFileRecord> = node_files::table
                .filter(node_files::node_id.eq(node_id))
                .order(node_files::created_at.asc())
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(NodeFile::from).collect())
        })
    }
}
