//! Store-level integration tests: idempotence, signature rejection, pattern
//! queries, and durability across reopen.

use degdb::config::NodeConfig;
use degdb::identity::Identity;
use degdb::node::Node;
use degdb::store::TripleStore;
use degdb::triple::{Triple, TriplePattern};

fn obama(identity: &Identity) -> Vec<Triple> {
    vec![
        Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama").signed_by(identity),
        Triple::new("/m/02mjmr", "/type/object/type", "/people/person").signed_by(identity),
    ]
}

#[test]
fn repeated_insert_persists_one_copy() {
    let store = TripleStore::memory_only();
    let identity = Identity::generate();
    let triple = Triple::new("/m/0hume", "/type/object/name", "Hume").signed_by(&identity);

    assert_eq!(store.insert(&[triple.clone()]).unwrap().count(), 1);
    for _ in 0..5 {
        let outcome = store.insert(&[triple.clone()]).unwrap();
        assert_eq!(outcome.count(), 0);
        assert_eq!(outcome.duplicates, 1);
    }
    assert_eq!(store.all(), vec![triple]);
}

#[test]
fn corrupted_signature_never_lands() {
    let store = TripleStore::memory_only();
    let identity = Identity::generate();
    let good = Triple::new("/m/0hume", "/type/object/type", "/organization/team").signed_by(&identity);

    let mut wrong_object = good.clone();
    wrong_object.object = "/people/person".into();
    let mut wrong_signer = good.clone();
    wrong_signer.signer = Identity::generate().id().to_string();
    let mut garbage_signature = good.clone();
    garbage_signature.signature = "zz".into();

    let outcome = store
        .insert(&[wrong_object, good.clone(), wrong_signer, garbage_signature])
        .unwrap();
    assert_eq!(outcome.count(), 1);
    assert_eq!(outcome.rejected, 3);
    assert_eq!(store.all(), vec![good]);
}

#[test]
fn query_by_each_position() {
    let store = TripleStore::memory_only();
    let identity = Identity::generate();
    let batch = vec![
        Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama").signed_by(&identity),
        Triple::new("/m/02mjmr", "/type/object/type", "/people/person").signed_by(&identity),
        Triple::new("/m/0hume", "/type/object/name", "Hume").signed_by(&identity),
        Triple::new("/m/0hume", "/type/object/type", "/organization/team").signed_by(&identity),
    ];
    store.insert(&batch).unwrap();

    for t in &batch {
        assert!(store.query(&TriplePattern::any().with_subject(&t.subject)).contains(t));
        assert!(store.query(&TriplePattern::any().with_predicate(&t.predicate)).contains(t));
        assert!(store.query(&TriplePattern::any().with_object(&t.object)).contains(t));

        let exact = TriplePattern::any()
            .with_subject(&t.subject)
            .with_predicate(&t.predicate)
            .with_object(&t.object);
        assert_eq!(store.query(&exact), vec![t.clone()]);
    }

    assert_eq!(store.query(&TriplePattern::any()).len(), 4);
    assert!(store
        .query(&TriplePattern::any().with_subject("/m/0hume").with_object("Barack Obama"))
        .is_empty());
}

#[test]
fn reopened_store_has_same_contents() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("triples.db");
    let identity = Identity::generate();

    // First session: insert and drop.
    {
        let store = TripleStore::open(&path).unwrap();
        assert_eq!(store.insert(&obama(&identity)).unwrap().count(), 2);
    }

    // Second session: contents and indices are rebuilt from disk.
    {
        let store = TripleStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store
                .query(&TriplePattern::any().with_predicate("/type/object/type"))
                .len(),
            1
        );
        assert_eq!(store.insert(&obama(&identity)).unwrap().count(), 0);
    }
}

#[tokio::test]
async fn lone_node_end_to_end() {
    let node = Node::start(NodeConfig::memory_only()).await.unwrap();
    let name = Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama");
    let kind = Triple::new("/m/02mjmr", "/type/object/type", "/people/person");

    assert_eq!(node.insert(vec![name.clone(), kind.clone()]).unwrap(), 2);

    let all = node.triples();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|t| t.verify().is_ok()));

    let by_subject = node.query(&TriplePattern::any().with_subject("/m/02mjmr"));
    assert_eq!(by_subject.len(), 2);

    let by_predicate = node.query(&TriplePattern::any().with_predicate("/type/object/type"));
    assert_eq!(by_predicate.len(), 1);
    assert_eq!(by_predicate[0].object, kind.object);

    node.shutdown().await;
}

#[tokio::test]
async fn node_keeps_identity_and_triples_across_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = NodeConfig {
        listen_addr: "127.0.0.1".into(),
        // Fixed templates so the ephemeral port does not change the paths.
        key_file: "node.key".into(),
        database_file: "node.db".into(),
        ..NodeConfig::in_dir(dir.path())
    };

    let first_id = {
        let node = Node::start(config.clone()).await.unwrap();
        node.insert(vec![Triple::new("/m/0hume", "/type/object/name", "Hume")])
            .unwrap();
        let id = node.id().to_string();
        node.shutdown().await;
        id
    };

    let node = Node::start(config).await.unwrap();
    assert_eq!(node.id(), first_id);
    let triples = node.triples();
    assert_eq!(triples.len(), 1);
    assert_eq!(triples[0].signer, first_id);
    assert!(node.info().persistent);
    node.shutdown().await;
}
