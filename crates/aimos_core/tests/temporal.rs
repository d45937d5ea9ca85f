use aimos_core::btsm::EdgeFilter;
use aimos_core::db::open_db_in_memory;
use aimos_core::error::ErrorKind;
use aimos_core::store::SqliteAtomStore;
use aimos_core::temporal::{parse_timestamp, query_atoms_as_of, query_atoms_in_range};
use aimos_core::{
    AtomStore, Bitemporal, BtsmRepository, Lifecycle, MpdEdge, MpdNode, NewAtom,
    SqliteBtsmRepository, TemporalError, TemporalQueryEngine, TimeDimension,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn day(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(offset)
}

/// `svc` recorded on day 0 (valid from day 1), superseded on day 10 by an
/// active version valid from day 12; one edge recorded on day 5.
fn seed(repo: &SqliteBtsmRepository<'_>) {
    let mut v1 = Bitemporal::open_at(day(0));
    v1.vt_start = day(1);
    let mut first = MpdNode::new("svc", "service")
        .with_policies(["policy.alpha"])
        .with_interval(v1);
    first.purpose = "v1".to_string();
    repo.upsert_nodes(&[first.clone(), MpdNode::new("db", "store").with_interval(Bitemporal::open_at(day(0)))])
        .unwrap();

    repo.upsert_edges(&[MpdEdge::depends_on("svc", "db").with_interval(Bitemporal::open_at(day(5)))])
        .unwrap();

    let mut v2 = Bitemporal::open_at(day(10));
    v2.vt_start = day(12);
    let mut second = first.with_lifecycle(Lifecycle::Active).with_interval(v2);
    second.purpose = "v2".to_string();
    repo.insert_node_version(&second).unwrap();
}

#[test]
fn as_of_queries_respect_each_time_axis() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteBtsmRepository::new(&conn);
    seed(&repo);
    let engine = TemporalQueryEngine::new(&repo);

    let purposes = |nodes: Vec<MpdNode>| {
        nodes
            .into_iter()
            .filter(|node| node.mpd_id == "svc")
            .map(|node| node.purpose)
            .collect::<Vec<_>>()
    };

    assert_eq!(
        purposes(engine.query_nodes_as_of(day(3), TimeDimension::Transaction).unwrap()),
        vec!["v1"]
    );
    assert_eq!(
        purposes(engine.query_nodes_as_of(day(10), TimeDimension::Transaction).unwrap()),
        vec!["v2"]
    );
    // v1's valid time never closes, so both versions hold on the valid axis.
    assert_eq!(
        purposes(engine.query_nodes_as_of(day(13), TimeDimension::Valid).unwrap()),
        vec!["v1", "v2"]
    );
    assert!(purposes(engine.query_nodes_as_of(day(0), TimeDimension::Valid).unwrap()).is_empty());

    let edges = engine
        .query_edges_as_of(day(4), TimeDimension::Transaction, &EdgeFilter::default())
        .unwrap();
    assert!(edges.is_empty());
    let edges = engine
        .query_edges_as_of(day(5), TimeDimension::Transaction, &EdgeFilter::default())
        .unwrap();
    assert_eq!(edges.len(), 1);
}

#[test]
fn range_queries_are_half_open_and_validated() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteBtsmRepository::new(&conn);
    seed(&repo);
    let engine = TemporalQueryEngine::new(&repo);

    let in_range = engine
        .query_nodes_in_range(day(10), day(11), TimeDimension::Transaction)
        .unwrap();
    let svc: Vec<_> = in_range.iter().filter(|node| node.mpd_id == "svc").collect();
    assert_eq!(svc.len(), 1);
    assert_eq!(svc[0].purpose, "v2");

    let edges = engine
        .query_edges_in_range(day(0), day(5), TimeDimension::Transaction, &EdgeFilter::default())
        .unwrap();
    assert!(edges.is_empty());

    let err = engine
        .query_nodes_in_range(day(5), day(1), TimeDimension::Valid)
        .unwrap_err();
    assert!(matches!(err, TemporalError::InvalidRange { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn history_changes_and_audit_trail_follow_versions() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteBtsmRepository::new(&conn);
    seed(&repo);
    let engine = TemporalQueryEngine::new(&repo);

    let history = engine.get_node_history("svc").unwrap();
    assert_eq!(
        history.iter().map(|node| node.purpose.as_str()).collect::<Vec<_>>(),
        vec!["v1", "v2"]
    );
    assert!(engine.get_node_history("unknown").unwrap().is_empty());

    let changes = engine
        .query_changes_between(day(4), day(11), TimeDimension::Transaction)
        .unwrap();
    assert_eq!(changes.nodes_added.len(), 1);
    assert_eq!(changes.nodes_added[0].purpose, "v2");
    assert_eq!(changes.nodes_modified.len(), 1);
    assert_eq!(changes.nodes_modified[0].purpose, "v1");
    assert_eq!(changes.edges_added.len(), 1);
    assert!(changes.edges_modified.is_empty());

    let trail = engine.audit_trail("svc").unwrap();
    assert_eq!(trail.first_seen, day(0));
    assert_eq!(trail.versions.len(), 2);
    assert_eq!(trail.current_version.unwrap().purpose, "v2");
    assert_eq!(trail.outgoing_edges.len(), 1);
    assert!(trail.incoming_edges.is_empty());

    let db_trail = engine.audit_trail("db").unwrap();
    assert_eq!(db_trail.incoming_edges.len(), 1);

    let err = engine.audit_trail("unknown").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn time_travel_rebuilds_the_graph_at_an_instant() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteBtsmRepository::new(&conn);
    seed(&repo);
    let engine = TemporalQueryEngine::new(&repo);

    let early = engine.time_travel(day(2), TimeDimension::Transaction).unwrap();
    assert_eq!(early.as_of, day(2));
    assert_eq!(early.nodes.len(), 2);
    assert!(early.edges.is_empty());

    let late = engine.time_travel(day(20), TimeDimension::Transaction).unwrap();
    assert_eq!(late.nodes.len(), 2);
    assert_eq!(late.edges.len(), 1);
    assert!(late
        .nodes
        .iter()
        .any(|node| node.mpd_id == "svc" && node.purpose == "v2"));
}

#[test]
fn atoms_are_filtered_by_creation_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAtomStore::open_in_memory(dir.path()).unwrap();
    let before = Utc::now() - Duration::seconds(1);
    let first = store.create_atom(NewAtom::text("first")).unwrap();
    let second = store.create_atom(NewAtom::text("second")).unwrap();
    let after = Utc::now() + Duration::seconds(1);

    assert!(query_atoms_as_of(&store, before).unwrap().is_empty());
    let all = query_atoms_as_of(&store, after).unwrap();
    assert_eq!(
        all.iter().map(|atom| atom.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
    assert_eq!(query_atoms_in_range(&store, before, after).unwrap().len(), 2);
    assert!(query_atoms_in_range(&store, after, before).is_err());
}

#[test]
fn caller_timestamps_are_parsed_as_utc() {
    assert_eq!(parse_timestamp("2024-01-02T02:00:00+02:00").unwrap(), day(1));
    let err = parse_timestamp("last tuesday").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
