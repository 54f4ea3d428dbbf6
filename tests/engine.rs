//! End-to-end coverage of the write path, revision history, rollback and
//! retro-migration.

use kardex::revision::{diff, RevisionEngine, RetroMigrator, RollbackOutcome};
use kardex::schema::{build_registry, ClassDef, ClassKind, RuleBook, SchemaSource, ShapeDef};
use kardex::{
    filter_by_permission, validate, ActorId, FilterOutcome, SchemaRegistry, Stamp, Storage,
    WallClock,
};
use serde_json::{json, Value};

fn registry() -> SchemaRegistry {
    let source = SchemaSource {
        shapes: vec![ShapeDef {
            name: "Track".into(),
            text: "title TEXT QUERY; seconds INT;".into(),
        }],
        classes: vec![
            ClassDef {
                name: "Album".into(),
                kind: ClassKind::Dynamic,
                text: "name TEXT QUERY; tracks {Track}[]; artist REF(Artist); \
                       notes LONGTEXT OPEN; grid INT[][];"
                    .into(),
            },
            ClassDef {
                name: "Artist".into(),
                kind: ClassKind::Dynamic,
                text: "name TEXT QUERY;".into(),
            },
        ],
    };
    build_registry(&source, &RuleBook::new()).unwrap()
}

fn stamp(actor: &str, ms: u64) -> Stamp {
    Stamp::new(WallClock(ms), ActorId::parse(actor).unwrap())
}

fn album(name: &str) -> Value {
    json!({
        "name": name,
        "tracks": [],
        "artist": null,
        "notes": null,
        "grid": [],
    })
}

#[test]
fn create_edit_and_reconstruct_round_trip() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("In Rainbows"), stamp("alice", 1), false, vec![])
        .unwrap();

    // Three further edits.
    let names = ["In Rainbows (disk 1)", "In Rainbows (deluxe)", "In Rainbows X"];
    for (i, name) in names.into_iter().enumerate() {
        let mut data = engine.reconstruct_at_current(created.item_id);
        data["name"] = json!(name);
        engine
            .commit_change(
                "Album",
                Some(created.item_id),
                data,
                stamp("alice", 2 + i as u64),
                false,
                vec![],
            )
            .unwrap();
    }

    let revs = engine.revisions_of(created.item_id).unwrap();
    assert_eq!(revs.len(), 4);
    assert!(revs[0].is_creation);

    // Reconstructing at revision i and re-applying i+1..n forward must
    // reproduce the stored current record exactly.
    let current = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    let engine = RevisionEngine::new(&registry, &mut storage);
    for i in 0..revs.len() {
        let mut state = engine.reconstruct_at(revs[i].id).unwrap();
        for rev in &revs[i + 1..] {
            kardex::revision::apply(&mut state, &rev.patch).unwrap();
        }
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            serde_json::to_string(&current.data).unwrap(),
            "replay from revision {i} diverged"
        );
    }
}

// Small helper used by the tests: current state is just the stored row.
trait CurrentData {
    fn reconstruct_at_current(&self, item_id: kardex::RowId) -> Value;
}

impl CurrentData for RevisionEngine<'_> {
    fn reconstruct_at_current(&self, item_id: kardex::RowId) -> Value {
        let revs = self.revisions_of(item_id).unwrap();
        self.reconstruct_at(revs.last().unwrap().id).unwrap()
    }
}

#[test]
fn rollback_of_same_actor_run_including_creation_deletes() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("X"), stamp("alice", 1), false, vec![])
        .unwrap();
    for i in 0..2u64 {
        let mut data = engine.reconstruct_at_current(created.item_id);
        data["notes"] = json!(format!("edit {i}"));
        engine
            .commit_change("Album", Some(created.item_id), data, stamp("alice", 2 + i), false, vec![])
            .unwrap();
    }

    let outcome = engine.rollback(created.item_id, stamp("alice", 10)).unwrap();
    assert_eq!(outcome, RollbackOutcome::Deleted);
    assert!(storage.items.select_by_id(created.item_id).unwrap().is_none());
    assert!(storage
        .deleted_items
        .select_by_id(created.item_id)
        .unwrap()
        .is_some());
    let log = storage.deletion_log.select_by_predicate(&|_| true).unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].is_deletion);
}

#[test]
fn rollback_of_later_actor_reverts_to_prior_state_and_tags() {
    use kardex::RevisionTag;

    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("Y"), stamp("alice", 1), false, vec![])
        .unwrap();
    let rev1 = engine.revisions_of(created.item_id).unwrap()[0].id;
    let state_at_rev1 = engine.reconstruct_at(rev1).unwrap();

    let mut data = state_at_rev1.clone();
    data["notes"] = json!("bob was here");
    engine
        .commit_change("Album", Some(created.item_id), data, stamp("bob", 2), false, vec![])
        .unwrap();

    let outcome = engine.rollback(created.item_id, stamp("bob", 3)).unwrap();
    let RollbackOutcome::Committed { revision_id } = outcome else {
        panic!("expected a committed rollback, got {outcome:?}");
    };

    let revs = engine.revisions_of(created.item_id).unwrap();
    assert_eq!(revs.len(), 3);
    assert_eq!(revs[2].id, revision_id);
    assert!(revs[2].has_tag(RevisionTag::Rollback));
    assert!(revs[1].has_tag(RevisionTag::Reverted));
    assert!(!revs[0].has_tag(RevisionTag::Reverted));

    let reconstructed = engine.reconstruct_at(revision_id).unwrap();
    assert_eq!(reconstructed, state_at_rev1);
}

#[test]
fn rollback_of_a_rollback_undoes_only_that_revision() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("Z"), stamp("alice", 1), false, vec![])
        .unwrap();
    let mut data = engine.reconstruct_at_current(created.item_id);
    data["notes"] = json!("bob's edit");
    engine
        .commit_change("Album", Some(created.item_id), data.clone(), stamp("bob", 2), false, vec![])
        .unwrap();

    // First rollback (by carol) undoes bob's edit.
    engine.rollback(created.item_id, stamp("carol", 3)).unwrap();
    // Second rollback undoes only the rollback itself, restoring bob's edit
    // rather than re-reverting deeper history.
    let outcome = engine.rollback(created.item_id, stamp("dave", 4)).unwrap();
    let RollbackOutcome::Committed { revision_id } = outcome else {
        panic!("expected a committed rollback");
    };
    let state = engine.reconstruct_at(revision_id).unwrap();
    assert_eq!(state, data);
}

#[test]
fn permission_filtered_write_path() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("Amnesiac"), stamp("alice", 1), false, vec![])
        .unwrap();
    let existing = storage.items.select_by_id(created.item_id).unwrap().unwrap();

    // A restricted actor tries to rename the album and edit the open notes
    // field; only the notes edit survives the filter.
    let mut submitted = existing.data.clone();
    submitted["name"] = json!("HACKED");
    submitted["notes"] = json!("saw them live in 2001");

    let merged = match filter_by_permission(&registry, "Album", &submitted, Some(&existing.data), false) {
        FilterOutcome::Merged(v) => v,
        other => panic!("expected merge, got {other:?}"),
    };
    assert_eq!(merged["name"], json!("Amnesiac"));
    assert_eq!(merged["notes"], json!("saw them live in 2001"));

    let violations = validate(registry.class("Album").unwrap(), &merged);
    assert!(violations.is_empty(), "unexpected violations: {violations:?}");

    let mut engine = RevisionEngine::new(&registry, &mut storage);
    engine
        .commit_change("Album", Some(created.item_id), merged, stamp("guest", 2), false, vec![])
        .unwrap();
    let row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    assert_eq!(row.data["notes"], json!("saw them live in 2001"));
}

#[test]
fn referential_integrity_blocks_deletion() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let artist = engine
        .commit_change("Artist", None, json!({ "name": "Radiohead" }), stamp("alice", 1), false, vec![])
        .unwrap();
    let mut data = album("Kid A");
    data["artist"] = json!(artist.item_id);
    engine
        .commit_change("Album", None, data, stamp("alice", 2), false, vec![])
        .unwrap();

    let referencing = engine.find_referencing_items(artist.item_id).unwrap();
    assert_eq!(referencing.len(), 1);
    assert_eq!(referencing[0].class_name, "Album");
    assert_eq!(referencing[0].display_name, "Kid A");

    let err = engine
        .delete_item(
            artist.item_id,
            stamp("alice", 3),
            kardex::DeletionReason::UserRequest,
            "cleanup",
        )
        .unwrap_err();
    assert!(err.to_string().contains("still referenced"));
}

#[test]
fn soft_delete_and_restore() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Artist", None, json!({ "name": "Unheard" }), stamp("alice", 1), false, vec![])
        .unwrap();
    engine
        .delete_item(created.item_id, stamp("alice", 2), kardex::DeletionReason::UserRequest, "dup")
        .unwrap();
    assert!(engine.find_by_name("Unheard").unwrap().is_empty());

    let mut engine = RevisionEngine::new(&registry, &mut storage);
    engine.restore_item(created.item_id, stamp("alice", 3)).unwrap();
    assert_eq!(engine.find_by_name("Unheard").unwrap().len(), 1);

    let log = storage.deletion_log.select_by_predicate(&|_| true).unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[0].is_deletion);
    assert!(!log[1].is_deletion);
}

#[test]
fn identity_retro_migration_changes_nothing() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("Pablo Honey"), stamp("alice", 1), false, vec![])
        .unwrap();
    for i in 0..2u64 {
        let mut data = engine.reconstruct_at_current(created.item_id);
        data["notes"] = json!(format!("note {i}"));
        engine
            .commit_change("Album", Some(created.item_id), data, stamp("alice", 2 + i), false, vec![])
            .unwrap();
    }

    let before_row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    let before_revs = storage.revisions.select_by_predicate(&|_| true).unwrap();
    assert_eq!(before_revs.len(), 3);

    let backup = storage.snapshot_for_backup().unwrap();
    assert_eq!(backup.revision_count, 3);
    let mut migrator = RetroMigrator::new(&registry, &mut storage, backup);
    migrator
        .migrate(created.item_id, &|original, _prev| Ok(original.clone()))
        .unwrap();

    let after_row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    let after_revs = storage.revisions.select_by_predicate(&|_| true).unwrap();
    assert_eq!(
        serde_json::to_string(&before_row).unwrap(),
        serde_json::to_string(&after_row).unwrap()
    );
    for (b, a) in before_revs.iter().zip(&after_revs) {
        assert_eq!(
            serde_json::to_string(&b.patch).unwrap(),
            serde_json::to_string(&a.patch).unwrap()
        );
    }
}

#[test]
fn reshaping_retro_migration_rewrites_history_consistently() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("live takes"), stamp("alice", 1), false, vec![])
        .unwrap();
    let mut data = engine.reconstruct_at_current(created.item_id);
    data["notes"] = json!("lowercase title was a mistake");
    engine
        .commit_change("Album", Some(created.item_id), data, stamp("alice", 2), false, vec![])
        .unwrap();

    let backup = storage.snapshot_for_backup().unwrap();
    let mut migrator = RetroMigrator::new(&registry, &mut storage, backup);
    migrator
        .migrate(created.item_id, &|original, _prev| {
            let mut v = original.clone();
            if let Some(name) = v["name"].as_str() {
                v["name"] = serde_json::Value::String(name.to_uppercase());
            }
            Ok(v)
        })
        .unwrap();

    // The rewritten chain must still replay cleanly to the stored record.
    let row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    assert_eq!(row.data["name"], json!("LIVE TAKES"));
    let mut revs = storage.revisions.select_by_predicate(&|_| true).unwrap();
    revs.sort_by_key(|r| r.id);
    let mut state = registry.get_default("Album").unwrap();
    for rev in &revs {
        kardex::revision::apply(&mut state, &rev.patch).unwrap();
    }
    assert_eq!(state, row.data);
    // Search text follows the transformed data.
    assert!(row.search_text.contains("LIVE TAKES"));
}

#[test]
fn query_paths_expand_to_exactly_the_queryable_leaves() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    // 0-dim (name), 1-dim of nested shape (tracks[].title), 2-dim (grid) is
    // not queryable and must not appear.
    let mut data = album("Hail to the Thief");
    data["tracks"] = json!([
        { "title": "2 + 2 = 5", "seconds": 193 },
        { "title": "Sit Down. Stand Up.", "seconds": 260 },
    ]);
    data["grid"] = json!([[1, 2], [3]]);
    let created = engine
        .commit_change("Album", None, data, stamp("alice", 1), false, vec![])
        .unwrap();

    let row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    let mut leaves = Vec::new();
    for prop_path in registry.query_paths("Album") {
        for value_path in kardex::path::expand(prop_path, &row.data) {
            leaves.push(kardex::path::read(&row.data, &value_path).unwrap().clone());
        }
    }
    assert_eq!(
        leaves,
        vec![
            json!("Hail to the Thief"),
            json!("2 + 2 = 5"),
            json!("Sit Down. Stand Up."),
        ]
    );

    // And the derived search text finds the item.
    let engine = RevisionEngine::new(&registry, &mut storage);
    assert_eq!(engine.find_by_name("sit down").unwrap().len(), 1);
}

#[test]
fn persisted_revision_patches_replay_after_json_round_trip() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let mut data = album("In Rainbows");
    data["tracks"] = json!([
        { "title": "Nude", "seconds": 261 },
        { "title": "Videotape", "seconds": 279 },
    ]);
    let created = engine
        .commit_change("Album", None, data, stamp("alice", 1), false, vec![])
        .unwrap();
    // A reorder, so the second patch carries index-keyed move marks.
    let mut reordered = engine.reconstruct_at_current(created.item_id);
    reordered["tracks"].as_array_mut().unwrap().reverse();
    engine
        .commit_change("Album", Some(created.item_id), reordered, stamp("alice", 2), false, vec![])
        .unwrap();

    // Round-trip every revision row through its serialized form, then replay
    // the decoded patches forward from the class default.
    let revs = storage.revisions.select_by_predicate(&|_| true).unwrap();
    let mut state = registry.get_default("Album").unwrap();
    for rev in &revs {
        let encoded = serde_json::to_string(rev).unwrap();
        let decoded: kardex::RevisionRow = serde_json::from_str(&encoded).unwrap();
        kardex::revision::apply(&mut state, &decoded.patch).unwrap();
    }
    let row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    assert_eq!(state, row.data);
}

#[test]
fn change_list_carries_patch_sizes_and_next_revision_walks_forward() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let mut data = album("Kid Amnesiae");
    data["tracks"] = json!([
        { "title": "Like Spinning Plates", "seconds": 239 },
        { "title": "Follow Me Around", "seconds": 186 },
    ]);
    let created = engine
        .commit_change("Album", None, data, stamp("alice", 1), false, vec![])
        .unwrap();
    let mut edited = engine.reconstruct_at_current(created.item_id);
    edited["notes"] = json!("ok");
    engine
        .commit_change("Album", Some(created.item_id), edited, stamp("alice", 2), true, vec![])
        .unwrap();

    let list = engine.change_list(created.item_id).unwrap();
    assert_eq!(list.len(), 2);
    // The creation patch carries whole track records; the notes edit is one
    // scalar, so the size delta between consecutive entries is negative.
    assert!(list[0].patch_size > list[1].patch_size);
    assert!(!list[0].is_minor);
    assert!(list[1].is_minor);

    let next = engine.next_revision(list[0].revision_id).unwrap().unwrap();
    assert_eq!(next.id, list[1].revision_id);
    assert!(engine.next_revision(list[1].revision_id).unwrap().is_none());
}

#[test]
fn commit_refuses_a_mismatched_class() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let artist = engine
        .commit_change("Artist", None, json!({ "name": "Thom" }), stamp("alice", 1), false, vec![])
        .unwrap();
    let err = engine
        .commit_change("Album", Some(artist.item_id), album("Solo"), stamp("alice", 2), false, vec![])
        .unwrap_err();
    assert!(err.to_string().contains("belongs to class"));
}

#[test]
fn diff_of_unchanged_record_is_none_and_commit_refuses() {
    let registry = registry();
    let mut storage = Storage::in_memory();
    let mut engine = RevisionEngine::new(&registry, &mut storage);

    let created = engine
        .commit_change("Album", None, album("OKNOTOK"), stamp("alice", 1), false, vec![])
        .unwrap();
    let row = storage.items.select_by_id(created.item_id).unwrap().unwrap();
    assert_eq!(diff(&row.data, &row.data), None);

    let mut engine = RevisionEngine::new(&registry, &mut storage);
    let err = engine
        .commit_change("Album", Some(created.item_id), row.data, stamp("alice", 2), false, vec![])
        .unwrap_err();
    assert!(err.to_string().contains("nothing changed"));
}
