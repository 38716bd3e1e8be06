use genrepo_core::context::{AppliedChange, BackingStore, PendingChange};
use genrepo_core::model::entity::to_document;
use genrepo_core::{
    Document, Entity, EntityKey, EntityType, GenericRepository, InMemoryStore, KeyField, KeyKind,
    KeyShapeError, PersistenceContext, RepoError, Repository, StoreResult, TrackMode, TrackingContext,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Person {
    person_id: Option<Uuid>,
    first_name: String,
    last_name: String,
    email: String,
}

impl Entity for Person {
    const NAME: &'static str = "person";
    const KEY: &'static [KeyField] = &[KeyField::generated("person_id", KeyKind::Uuid)];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderLine {
    order_no: i64,
    line: String,
    quantity: u32,
}

impl Entity for OrderLine {
    const NAME: &'static str = "order_line";
    const KEY: &'static [KeyField] = &[
        KeyField::assigned("order_no", KeyKind::Integer),
        KeyField::assigned("line", KeyKind::Text),
    ];
}

fn person(first_name: &str, last_name: &str) -> Person {
    Person {
        person_id: None,
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email: format!("{}@rebellion.example", first_name.to_lowercase()),
    }
}

fn person_repo(store: &InMemoryStore) -> GenericRepository<TrackingContext<InMemoryStore>, Person> {
    GenericRepository::new(TrackingContext::new(store.clone()))
}

fn id_of(person: &Person) -> Uuid {
    person.person_id.expect("persisted person should have an id")
}

/// Delegates to an in-memory store and counts reads.
struct CountingStore {
    inner: InMemoryStore,
    loads: Rc<Cell<usize>>,
}

impl BackingStore for CountingStore {
    fn load(&self, entity_type: EntityType, key: &EntityKey) -> StoreResult<Option<Document>> {
        self.loads.set(self.loads.get() + 1);
        self.inner.load(entity_type, key)
    }

    fn load_all(&self, entity_type: EntityType) -> StoreResult<Vec<Document>> {
        self.loads.set(self.loads.get() + 1);
        self.inner.load_all(entity_type)
    }

    fn apply(&mut self, changes: &[PendingChange]) -> StoreResult<Vec<AppliedChange>> {
        self.inner.apply(changes)
    }
}

#[test]
fn luke_and_han_are_both_returned_by_get_all() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);

    repo.insert(person("Luke", "Skywalker")).unwrap();
    repo.insert(person("Han", "Solo")).unwrap();

    let all = repo.get_all().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(
        all.iter().filter(|p| p.first_name == "Luke").count(),
        1,
        "expected exactly one Luke"
    );
    assert_eq!(all.iter().filter(|p| p.first_name == "Han").count(), 1);
}

#[test]
fn get_all_returns_exactly_the_inserted_entities_in_insertion_order() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);

    let inserted: Vec<Person> = ["Leia", "Chewbacca", "Lando"]
        .into_iter()
        .map(|name| repo.insert(person(name, "Rebel")).unwrap())
        .collect();

    let fresh = person_repo(&store).get_all().unwrap();
    assert_eq!(fresh, inserted);
}

#[test]
fn insert_fills_generated_key_and_find_returns_equal_entity() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);

    let inserted = repo.insert(person("Luke", "Skywalker")).unwrap();
    let id = id_of(&inserted);
    assert!(!id.is_nil());

    assert_eq!(repo.find(id).unwrap(), Some(inserted.clone()));
    assert_eq!(person_repo(&store).find(id).unwrap(), Some(inserted));
}

#[test]
fn find_unknown_key_returns_none() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    repo.insert(person("Luke", "Skywalker")).unwrap();

    assert_eq!(repo.find(Uuid::new_v4()).unwrap(), None);
}

#[test]
fn find_with_wrong_key_shape_fails_before_touching_the_store() {
    let loads = Rc::new(Cell::new(0));
    let store = CountingStore {
        inner: InMemoryStore::new(),
        loads: Rc::clone(&loads),
    };
    let mut repo: GenericRepository<_, Person> = GenericRepository::new(TrackingContext::new(store));

    let err = repo.find((Uuid::new_v4(), 2_i64)).unwrap_err();
    assert!(matches!(
        err,
        RepoError::InvalidKeyShape(KeyShapeError::ArityMismatch {
            expected: 1,
            actual: 2,
            ..
        })
    ));

    let err = repo.find("not-a-uuid").unwrap_err();
    assert!(matches!(
        err,
        RepoError::InvalidKeyShape(KeyShapeError::KindMismatch {
            expected: KeyKind::Uuid,
            actual: KeyKind::Text,
            ..
        })
    ));
    assert_eq!(loads.get(), 0);

    repo.find(Uuid::new_v4()).unwrap();
    assert_eq!(loads.get(), 1);
}

#[test]
fn update_replaces_stored_values_without_duplicating_identity() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    let mut han = repo.insert(person("Han", "Solo")).unwrap();
    repo.insert(person("Luke", "Skywalker")).unwrap();

    han.email = "captain@falcon.example".to_string();
    repo.update(&han).unwrap();

    let mut other = person_repo(&store);
    let found = other.find(id_of(&han)).unwrap().unwrap();
    assert_eq!(found.email, "captain@falcon.example");
    let same_identity = other
        .get_all()
        .unwrap()
        .into_iter()
        .filter(|p| p.person_id == han.person_id)
        .count();
    assert_eq!(same_identity, 1);
}

#[test]
fn update_of_unknown_entity_is_not_found_and_unset_key_is_rejected() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);

    let mut ghost = person("Ben", "Kenobi");
    ghost.person_id = Some(Uuid::new_v4());
    let err = repo.update(&ghost).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { entity: "person", .. }));
    assert_eq!(repo.context().pending_count(), 0);

    let err = repo.update(&person("Ben", "Kenobi")).unwrap_err();
    assert!(matches!(
        err,
        RepoError::InvalidKeyShape(KeyShapeError::UnsetKey {
            field: "person_id",
            ..
        })
    ));
}

#[test]
fn delete_removes_entity_and_second_delete_is_not_found() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    let luke = repo.insert(person("Luke", "Skywalker")).unwrap();
    let han = repo.insert(person("Han", "Solo")).unwrap();

    repo.delete(&luke).unwrap();
    assert_eq!(repo.find(id_of(&luke)).unwrap(), None);
    assert_eq!(person_repo(&store).get_all().unwrap(), vec![han]);

    let err = repo.delete(&luke).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { .. }));
    assert_eq!(store.count(Person::entity_type()).unwrap(), 1);
}

#[test]
fn duplicate_insert_is_a_constraint_violation() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    let luke = repo.insert(person("Luke", "Skywalker")).unwrap();

    let err = repo.insert(luke.clone()).unwrap_err();
    assert!(matches!(err, RepoError::ConstraintViolation { .. }));

    let err = person_repo(&store).insert(luke).unwrap_err();
    assert!(matches!(err, RepoError::ConstraintViolation { .. }));
    assert_eq!(store.count(Person::entity_type()).unwrap(), 1);
}

#[test]
fn composite_assigned_keys_round_through_find_update_and_delete() {
    let store = InMemoryStore::new();
    let mut repo: GenericRepository<_, OrderLine> =
        GenericRepository::new(TrackingContext::new(store.clone()));

    let first = repo
        .insert(OrderLine {
            order_no: 7,
            line: "a".to_string(),
            quantity: 1,
        })
        .unwrap();
    repo.insert(OrderLine {
        order_no: 7,
        line: "b".to_string(),
        quantity: 3,
    })
    .unwrap();

    assert_eq!(repo.find((7_i64, "a")).unwrap(), Some(first.clone()));
    assert_eq!(repo.find((8_i64, "a")).unwrap(), None);
    assert!(matches!(
        repo.find(7_i64),
        Err(RepoError::InvalidKeyShape(KeyShapeError::ArityMismatch { .. }))
    ));

    let mut changed = first.clone();
    changed.quantity = 5;
    repo.update(&changed).unwrap();
    assert_eq!(repo.find((7_i64, "a")).unwrap().unwrap().quantity, 5);

    repo.delete(&changed).unwrap();
    assert_eq!(repo.get_all().unwrap().len(), 1);
}

#[test]
fn find_reads_pending_changes_of_its_context() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    let luke = repo.insert(person("Luke", "Skywalker")).unwrap();
    let id = id_of(&luke);

    let mut renamed = luke.clone();
    renamed.last_name = "Organa".to_string();
    repo.context_mut()
        .track(
            Person::entity_type(),
            to_document(&renamed).unwrap(),
            TrackMode::Modified,
        )
        .unwrap();
    assert_eq!(repo.find(id).unwrap(), Some(renamed));
    assert_eq!(person_repo(&store).find(id).unwrap(), Some(luke.clone()));

    repo.context_mut().discard_pending();
    repo.context_mut()
        .track(
            Person::entity_type(),
            to_document(&luke).unwrap(),
            TrackMode::Removed,
        )
        .unwrap();
    assert_eq!(repo.find(id).unwrap(), None);

    repo.context_mut().discard_pending();
    assert_eq!(repo.find(id).unwrap(), Some(luke));
}

#[test]
fn failed_commit_withdraws_only_the_failing_change() {
    let store = InMemoryStore::new();
    let mut context = TrackingContext::new(store.clone());
    context
        .track(
            Person::entity_type(),
            to_document(&person("Wedge", "Antilles")).unwrap(),
            TrackMode::Added,
        )
        .unwrap();

    {
        let mut repo: GenericRepository<_, Person> = GenericRepository::new(&mut context);
        let mut ghost = person("Biggs", "Darklighter");
        ghost.person_id = Some(Uuid::new_v4());

        let err = repo.delete(&ghost).unwrap_err();
        assert!(matches!(err, RepoError::NotFound { .. }));
    }

    assert_eq!(context.pending_count(), 1);
    assert_eq!(store.count(Person::entity_type()).unwrap(), 0);

    let report = context.commit().unwrap();
    assert_eq!(report.count(TrackMode::Added), 1);
    assert_eq!(store.count(Person::entity_type()).unwrap(), 1);
}

#[test]
fn repositories_sharing_a_context_commit_each_others_pending_changes() {
    let store = InMemoryStore::new();
    let mut context = TrackingContext::new(store.clone());
    context
        .track(
            OrderLine::entity_type(),
            to_document(&OrderLine {
                order_no: 1,
                line: "x".to_string(),
                quantity: 2,
            })
            .unwrap(),
            TrackMode::Added,
        )
        .unwrap();

    let mut people: GenericRepository<_, Person> = GenericRepository::new(&mut context);
    people.insert(person("Mon", "Mothma")).unwrap();

    assert_eq!(store.count(OrderLine::entity_type()).unwrap(), 1);
    assert_eq!(store.count(Person::entity_type()).unwrap(), 1);
}

#[test]
fn into_context_hands_back_the_tracked_unit_of_work() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    repo.insert(person("Luke", "Skywalker")).unwrap();
    repo.get_all().unwrap();

    let context = repo.into_context();
    assert_eq!(context.tracker().tracked_count(), 1);
    assert_eq!(context.pending_count(), 0);

    let handle = context.into_store();
    assert_eq!(handle.count(Person::entity_type()).unwrap(), 1);
}

fn enlist(people: &mut dyn Repository<Person>, first_name: &str, last_name: &str) -> Person {
    people.insert(person(first_name, last_name)).unwrap()
}

#[test]
fn crud_works_through_a_repository_trait_object() {
    let store = InMemoryStore::new();
    let mut repo = person_repo(&store);
    let people: &mut dyn Repository<Person> = &mut repo;

    let leia = enlist(people, "Leia", "Organa");
    let wedge = enlist(people, "Wedge", "Antilles");
    assert_eq!(people.get_all().unwrap().len(), 2);

    let mut general = leia.clone();
    general.last_name = "Organa Solo".to_string();
    people.update(&general).unwrap();
    assert_eq!(
        people.find(EntityKey::from(id_of(&leia))).unwrap(),
        Some(general)
    );

    people.delete(&wedge).unwrap();
    assert_eq!(people.find(EntityKey::from(id_of(&wedge))).unwrap(), None);
    assert!(matches!(
        people.delete(&wedge),
        Err(RepoError::NotFound { .. })
    ));
    assert_eq!(store.count(Person::entity_type()).unwrap(), 1);
}
