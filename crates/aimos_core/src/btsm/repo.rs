//! BTSM repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Store node versions keyed by `(mpd_id, tt_start)` and edges keyed by
//!   `(source_id, target_id, relation, tt_start)`.
//! - Apply `depends_on` policy inheritance and degree caps before writing.
//!
//! # Invariants
//! - The current version of a node is its row with `tt_end IS NULL`.
//! - `upsert_nodes` replaces the current version's attributes in place
//!   (latest wins); `insert_node_version` appends history instead.
//! - A batch either fully commits or leaves the graph untouched.

use super::{merge_policies, BtsmError, BtsmResult, EdgeFilter, NodeFilter};
use crate::model::mpd::{Bitemporal, EdgeRelation, Kpi, Lifecycle, MpdEdge, MpdNode};
use crate::model::time;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;

const NODE_SELECT_SQL: &str = "SELECT
    mpd_id,
    node_type,
    purpose,
    capabilities_json,
    interfaces_json,
    manager_of_json,
    depends_on_json,
    policy_pack_ids_json,
    budgets_json,
    owners_json,
    links_json,
    kpis_json,
    lifecycle,
    witness,
    max_dependency_degree,
    tt_start,
    tt_end,
    vt_start,
    vt_end
FROM mpd_nodes";

const EDGE_SELECT_SQL: &str = "SELECT
    source_id,
    target_id,
    relation,
    policy_pack_ids_json,
    tt_start,
    tt_end,
    vt_start,
    vt_end
FROM mpd_edges";

/// Persistence contract for the traceability graph.
pub trait BtsmRepository {
    /// Latest-wins upsert by `mpd_id`. Returns the number of nodes written.
    fn upsert_nodes(&self, nodes: &[MpdNode]) -> BtsmResult<usize>;
    /// Appends a new version, closing the current one at `node.tt_start`.
    fn insert_node_version(&self, node: &MpdNode) -> BtsmResult<()>;
    /// Validated upsert; returns the stored rows (with merged policies).
    fn upsert_edges(&self, edges: &[MpdEdge]) -> BtsmResult<Vec<MpdEdge>>;
    /// Current node versions matching `filter`, ordered by `mpd_id`.
    fn fetch_nodes(&self, filter: &NodeFilter) -> BtsmResult<Vec<MpdNode>>;
    /// Current (not tt-closed) edges matching `filter`.
    fn fetch_edges(&self, filter: &EdgeFilter) -> BtsmResult<Vec<MpdEdge>>;
    fn get_node(&self, mpd_id: &str) -> BtsmResult<Option<MpdNode>>;
    /// Every stored version of every node, ordered by `(mpd_id, tt_start)`.
    fn all_node_versions(&self) -> BtsmResult<Vec<MpdNode>>;
    /// Every stored edge row including tt-closed ones.
    fn all_edges(&self) -> BtsmResult<Vec<MpdEdge>>;
}

/// SQLite-backed BTSM repository.
pub struct SqliteBtsmRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteBtsmRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl BtsmRepository for SqliteBtsmRepository<'_> {
    fn upsert_nodes(&self, nodes: &[MpdNode]) -> BtsmResult<usize> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for node in nodes {
            validate_node(node)?;
            match current_node(&tx, &node.mpd_id)? {
                Some(current) => {
                    ensure_forward(&current, node)?;
                    // Row identity (tt_start) is kept; everything else is replaced.
                    let mut merged = node.clone();
                    merged.interval.tt_start = current.interval.tt_start;
                    merged
                        .interval
                        .validate()
                        .map_err(BtsmError::Validation)?;
                    update_node_row(&tx, &merged)?;
                }
                None => insert_node_row(&tx, node)?,
            }
        }
        tx.commit()?;
        info!(
            "event=upsert_nodes module=btsm status=ok count={}",
            nodes.len()
        );
        Ok(nodes.len())
    }

    fn insert_node_version(&self, node: &MpdNode) -> BtsmResult<()> {
        validate_node(node)?;
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if let Some(current) = current_node(&tx, &node.mpd_id)? {
            ensure_forward(&current, node)?;
            if node.interval.tt_start <= current.interval.tt_start {
                return Err(BtsmError::Validation(format!(
                    "new version of {} must start after {}",
                    node.mpd_id,
                    time::to_storage(&current.interval.tt_start)
                )));
            }
            tx.execute(
                "UPDATE mpd_nodes SET tt_end = ?3 WHERE mpd_id = ?1 AND tt_start = ?2;",
                params![
                    current.mpd_id,
                    time::to_storage(&current.interval.tt_start),
                    time::to_storage(&node.interval.tt_start),
                ],
            )?;
        }
        insert_node_row(&tx, node)?;
        tx.commit()?;
        info!(
            "event=insert_node_version module=btsm status=ok mpd_id={} lifecycle={}",
            node.mpd_id, node.lifecycle
        );
        Ok(())
    }

    fn upsert_edges(&self, edges: &[MpdEdge]) -> BtsmResult<Vec<MpdEdge>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut stored = Vec::with_capacity(edges.len());
        for edge in edges {
            stored.push(upsert_edge(&tx, edge)?);
        }
        tx.commit()?;
        info!(
            "event=upsert_edges module=btsm status=ok count={}",
            stored.len()
        );
        Ok(stored)
    }

    fn fetch_nodes(&self, filter: &NodeFilter) -> BtsmResult<Vec<MpdNode>> {
        let nodes = query_nodes(
            self.conn,
            &format!("{NODE_SELECT_SQL} WHERE tt_end IS NULL ORDER BY mpd_id ASC;"),
            [],
        )?;
        Ok(nodes.into_iter().filter(|node| filter.accepts(node)).collect())
    }

    fn fetch_edges(&self, filter: &EdgeFilter) -> BtsmResult<Vec<MpdEdge>> {
        let edges = query_edges(
            self.conn,
            &format!(
                "{EDGE_SELECT_SQL} WHERE tt_end IS NULL
                 ORDER BY source_id ASC, tt_start ASC, target_id ASC, relation ASC;"
            ),
            [],
        )?;
        Ok(edges.into_iter().filter(|edge| filter.accepts(edge)).collect())
    }

    fn get_node(&self, mpd_id: &str) -> BtsmResult<Option<MpdNode>> {
        current_node(self.conn, mpd_id)
    }

    fn all_node_versions(&self) -> BtsmResult<Vec<MpdNode>> {
        query_nodes(
            self.conn,
            &format!("{NODE_SELECT_SQL} ORDER BY mpd_id ASC, tt_start ASC;"),
            [],
        )
    }

    fn all_edges(&self) -> BtsmResult<Vec<MpdEdge>> {
        query_edges(
            self.conn,
            &format!("{EDGE_SELECT_SQL} ORDER BY tt_start ASC, source_id ASC, target_id ASC;"),
            [],
        )
    }
}

fn validate_node(node: &MpdNode) -> BtsmResult<()> {
    if node.mpd_id.trim().is_empty() {
        return Err(BtsmError::Validation("mpd_id must not be blank".to_string()));
    }
    if node.node_type.trim().is_empty() {
        return Err(BtsmError::Validation(format!(
            "node {} requires a type",
            node.mpd_id
        )));
    }
    node.interval.validate().map_err(BtsmError::Validation)
}

fn ensure_forward(current: &MpdNode, next: &MpdNode) -> BtsmResult<()> {
    if current.lifecycle.can_transition_to(next.lifecycle) {
        return Ok(());
    }
    Err(BtsmError::LifecycleRegression {
        mpd_id: current.mpd_id.clone(),
        from: current.lifecycle,
        to: next.lifecycle,
    })
}

fn upsert_edge(conn: &Connection, edge: &MpdEdge) -> BtsmResult<MpdEdge> {
    if edge.source_id.trim().is_empty() || edge.target_id.trim().is_empty() {
        return Err(BtsmError::Validation(
            "edge source_id and target_id must not be blank".to_string(),
        ));
    }
    edge.interval.validate().map_err(BtsmError::Validation)?;

    let mut edge = edge.clone();
    if edge.relation == EdgeRelation::DependsOn {
        let source = current_node(conn, &edge.source_id)?;
        let source_policies = source
            .as_ref()
            .map(|node| node.policy_pack_ids.clone())
            .unwrap_or_default();
        edge.policy_pack_ids =
            merge_policies([source_policies.as_slice(), edge.policy_pack_ids.as_slice()]);
        if edge.policy_pack_ids.is_empty() {
            warn!(
                "event=upsert_edges module=btsm status=error error_code=policy_violation source_id={} target_id={}",
                edge.source_id, edge.target_id
            );
            return Err(BtsmError::PolicyViolation {
                source_id: edge.source_id.clone(),
                target_id: edge.target_id.clone(),
            });
        }

        let limit = source.map_or(0, |node| node.max_dependency_degree);
        if limit > 0 && open_edge(conn, &edge)?.is_none() {
            let open_edges = count_open_depends_on(conn, &edge.source_id)?;
            if open_edges >= limit {
                warn!(
                    "event=upsert_edges module=btsm status=error error_code=degree_exceeded source_id={} limit={}",
                    edge.source_id, limit
                );
                return Err(BtsmError::DegreeExceeded {
                    source_id: edge.source_id.clone(),
                    limit,
                    open_edges,
                });
            }
        }
    }

    // Re-posting an already-open relation refreshes it instead of adding a row.
    if edge.interval.is_open() {
        if let Some(existing) = open_edge(conn, &edge)? {
            if existing.interval.tt_start != edge.interval.tt_start {
                let policies = merge_policies([
                    existing.policy_pack_ids.as_slice(),
                    edge.policy_pack_ids.as_slice(),
                ]);
                conn.execute(
                    "UPDATE mpd_edges SET policy_pack_ids_json = ?5
                     WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3 AND tt_start = ?4;",
                    params![
                        existing.source_id,
                        existing.target_id,
                        existing.relation.as_str(),
                        time::to_storage(&existing.interval.tt_start),
                        serde_json::to_string(&policies)?,
                    ],
                )?;
                return Ok(MpdEdge {
                    policy_pack_ids: policies,
                    ..existing
                });
            }
        }
    }

    conn.execute(
        "INSERT INTO mpd_edges (
            source_id,
            target_id,
            relation,
            policy_pack_ids_json,
            tt_start,
            tt_end,
            vt_start,
            vt_end
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (source_id, target_id, relation, tt_start) DO UPDATE SET
            policy_pack_ids_json = excluded.policy_pack_ids_json,
            tt_end = excluded.tt_end,
            vt_start = excluded.vt_start,
            vt_end = excluded.vt_end;",
        params![
            edge.source_id,
            edge.target_id,
            edge.relation.as_str(),
            serde_json::to_string(&edge.policy_pack_ids)?,
            time::to_storage(&edge.interval.tt_start),
            edge.interval.tt_end.as_ref().map(time::to_storage),
            time::to_storage(&edge.interval.vt_start),
            edge.interval.vt_end.as_ref().map(time::to_storage),
        ],
    )?;
    Ok(edge)
}

fn open_edge(conn: &Connection, edge: &MpdEdge) -> BtsmResult<Option<MpdEdge>> {
    let mut stmt = conn.prepare(&format!(
        "{EDGE_SELECT_SQL}
         WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3
           AND vt_end IS NULL AND tt_end IS NULL
         ORDER BY tt_start DESC
         LIMIT 1;"
    ))?;
    let mut rows = stmt.query(params![
        edge.source_id,
        edge.target_id,
        edge.relation.as_str()
    ])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_edge_row(row)?)),
        None => Ok(None),
    }
}

fn count_open_depends_on(conn: &Connection, source_id: &str) -> BtsmResult<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mpd_edges
         WHERE source_id = ?1 AND relation = ?2 AND vt_end IS NULL AND tt_end IS NULL;",
        params![source_id, EdgeRelation::DependsOn.as_str()],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

fn current_node(conn: &Connection, mpd_id: &str) -> BtsmResult<Option<MpdNode>> {
    let row = conn
        .query_row(
            &format!(
                "{NODE_SELECT_SQL} WHERE mpd_id = ?1 AND tt_end IS NULL
                 ORDER BY tt_start DESC LIMIT 1;"
            ),
            [mpd_id],
            |row| Ok(parse_node_row(row)),
        )
        .optional()?;
    row.transpose()
}

fn insert_node_row(conn: &Connection, node: &MpdNode) -> BtsmResult<()> {
    conn.execute(
        "INSERT INTO mpd_nodes (
            mpd_id,
            node_type,
            purpose,
            capabilities_json,
            interfaces_json,
            manager_of_json,
            depends_on_json,
            policy_pack_ids_json,
            budgets_json,
            owners_json,
            links_json,
            kpis_json,
            lifecycle,
            witness,
            max_dependency_degree,
            tt_start,
            tt_end,
            vt_start,
            vt_end
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19);",
        params![
            node.mpd_id,
            node.node_type,
            node.purpose,
            serde_json::to_string(&node.capabilities)?,
            serde_json::to_string(&node.interfaces)?,
            serde_json::to_string(&node.manager_of)?,
            serde_json::to_string(&node.depends_on)?,
            serde_json::to_string(&node.policy_pack_ids)?,
            serde_json::to_string(&node.budgets)?,
            serde_json::to_string(&node.owners)?,
            serde_json::to_string(&node.links)?,
            serde_json::to_string(&node.kpis)?,
            node.lifecycle.as_str(),
            node.witness.as_deref(),
            i64::from(node.max_dependency_degree),
            time::to_storage(&node.interval.tt_start),
            node.interval.tt_end.as_ref().map(time::to_storage),
            time::to_storage(&node.interval.vt_start),
            node.interval.vt_end.as_ref().map(time::to_storage),
        ],
    )?;
    Ok(())
}

fn update_node_row(conn: &Connection, node: &MpdNode) -> BtsmResult<()> {
    conn.execute(
        "UPDATE mpd_nodes
         SET
            node_type = ?3,
            purpose = ?4,
            capabilities_json = ?5,
            interfaces_json = ?6,
            manager_of_json = ?7,
            depends_on_json = ?8,
            policy_pack_ids_json = ?9,
            budgets_json = ?10,
            owners_json = ?11,
            links_json = ?12,
            kpis_json = ?13,
            lifecycle = ?14,
            witness = ?15,
            max_dependency_degree = ?16,
            tt_end = ?17,
            vt_start = ?18,
            vt_end = ?19
         WHERE mpd_id = ?1 AND tt_start = ?2;",
        params![
            node.mpd_id,
            time::to_storage(&node.interval.tt_start),
            node.node_type,
            node.purpose,
            serde_json::to_string(&node.capabilities)?,
            serde_json::to_string(&node.interfaces)?,
            serde_json::to_string(&node.manager_of)?,
            serde_json::to_string(&node.depends_on)?,
            serde_json::to_string(&node.policy_pack_ids)?,
            serde_json::to_string(&node.budgets)?,
            serde_json::to_string(&node.owners)?,
            serde_json::to_string(&node.links)?,
            serde_json::to_string(&node.kpis)?,
            node.lifecycle.as_str(),
            node.witness.as_deref(),
            i64::from(node.max_dependency_degree),
            node.interval.tt_end.as_ref().map(time::to_storage),
            time::to_storage(&node.interval.vt_start),
            node.interval.vt_end.as_ref().map(time::to_storage),
        ],
    )?;
    Ok(())
}

fn query_nodes<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> BtsmResult<Vec<MpdNode>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        nodes.push(parse_node_row(row)?);
    }
    Ok(nodes)
}

fn query_edges<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> BtsmResult<Vec<MpdEdge>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut edges = Vec::new();
    while let Some(row) = rows.next()? {
        edges.push(parse_edge_row(row)?);
    }
    Ok(edges)
}

fn parse_node_row(row: &Row<'_>) -> BtsmResult<MpdNode> {
    let mpd_id: String = row.get("mpd_id")?;
    let lifecycle_text: String = row.get("lifecycle")?;
    let lifecycle = Lifecycle::parse(&lifecycle_text).ok_or_else(|| {
        BtsmError::InvalidData(format!(
            "invalid lifecycle `{lifecycle_text}` for node {mpd_id}"
        ))
    })?;
    let degree: i64 = row.get("max_dependency_degree")?;
    let kpis: Vec<Kpi> = decode_column(row, "kpis_json")?;

    Ok(MpdNode {
        node_type: row.get("node_type")?,
        purpose: row.get("purpose")?,
        capabilities: decode_column(row, "capabilities_json")?,
        interfaces: decode_column(row, "interfaces_json")?,
        manager_of: decode_column(row, "manager_of_json")?,
        depends_on: decode_column(row, "depends_on_json")?,
        policy_pack_ids: decode_column(row, "policy_pack_ids_json")?,
        budgets: decode_column(row, "budgets_json")?,
        owners: decode_column(row, "owners_json")?,
        links: decode_column(row, "links_json")?,
        kpis,
        lifecycle,
        witness: row.get("witness")?,
        max_dependency_degree: u32::try_from(degree).map_err(|_| {
            BtsmError::InvalidData(format!(
                "invalid max_dependency_degree `{degree}` for node {mpd_id}"
            ))
        })?,
        interval: parse_interval(row)?,
        mpd_id,
    })
}

fn parse_edge_row(row: &Row<'_>) -> BtsmResult<MpdEdge> {
    let relation: String = row.get("relation")?;
    Ok(MpdEdge {
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relation: EdgeRelation::parse(&relation),
        policy_pack_ids: decode_column(row, "policy_pack_ids_json")?,
        interval: parse_interval(row)?,
    })
}

fn parse_interval(row: &Row<'_>) -> BtsmResult<Bitemporal> {
    Ok(Bitemporal {
        tt_start: parse_time(row.get("tt_start")?)?,
        tt_end: row
            .get::<_, Option<String>>("tt_end")?
            .map(parse_time)
            .transpose()?,
        vt_start: parse_time(row.get("vt_start")?)?,
        vt_end: row
            .get::<_, Option<String>>("vt_end")?
            .map(parse_time)
            .transpose()?,
    })
}

fn parse_time(value: String) -> BtsmResult<DateTime<Utc>> {
    time::parse(&value).map_err(BtsmError::InvalidData)
}

fn decode_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> BtsmResult<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text)
        .map_err(|err| BtsmError::InvalidData(format!("invalid json in column {column}: {err}")))
}
