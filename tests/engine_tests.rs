//! Integration tests for query execution: criteria semantics, partitions,
//! sub-queries, updates and projections.

use proptest::prelude::*;
use strata_core::{
    AttributeDescriptor, AttributeType, AttributeValue, Engine, Entity, EntityDescriptor,
    GeneratorStrategy, IdentifierDescriptor, IndexController, IndexDescriptor, Operator,
    PartitionTarget, Query, QueryCriteria,
};

fn person_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(
        "Person",
        IdentifierDescriptor::new("id", GeneratorStrategy::Sequence),
    )
    .add_attribute(AttributeDescriptor::new("id", AttributeType::Int))
    .add_attribute(AttributeDescriptor::new("name", AttributeType::String))
    .add_attribute(AttributeDescriptor::new("age", AttributeType::Int))
    .add_attribute(AttributeDescriptor::new("region", AttributeType::String))
    .add_index(IndexDescriptor::new("idx_age", "age"))
    .with_partition("region")
}

fn engine_with_people(ages: &[i64]) -> Engine {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();
    for age in ages {
        let mut person = Entity::new("Person")
            .set("age", AttributeValue::Int(*age))
            .set("name", AttributeValue::String(format!("person-{age}")));
        engine.save(&mut person).unwrap();
    }
    engine
}

fn ages_of(results: &[Entity]) -> Vec<i64> {
    results
        .iter()
        .filter_map(|entity| entity.get("age").and_then(AttributeValue::as_i64))
        .collect()
}

#[test]
fn test_range_criteria() {
    let engine = engine_with_people(&[4, 5, 6, 7, 8, 9]);
    let mut query = Query::new("Person").with_criteria(
        QueryCriteria::new("age", Operator::GreaterThan, AttributeValue::Int(5)).and(
            QueryCriteria::new("age", Operator::LessThan, AttributeValue::Int(8)),
        ),
    );
    assert_eq!(ages_of(&engine.find(&mut query).unwrap()), vec![6, 7]);
}

#[test]
fn test_and_or_not_through_engine() {
    let engine = engine_with_people(&[10]);
    let matching = || QueryCriteria::new("age", Operator::Equal, AttributeValue::Int(10));
    let failing = || QueryCriteria::new("age", Operator::Equal, AttributeValue::Int(99));

    let count = |criteria: QueryCriteria| {
        engine
            .find(&mut Query::new("Person").with_criteria(criteria))
            .unwrap()
            .len()
    };

    assert_eq!(count(matching().and(failing())), 0);
    assert_eq!(count(matching().or(failing())), 1);
    assert_eq!(count(matching().and(failing()).not()), 1);
    assert_eq!(count(matching().or(failing()).not()), 0);
}

#[test]
fn test_string_operators_through_engine() {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();
    for name in ["Alice", "Albert", "Bob"] {
        let mut person = Entity::new("Person").set("name", AttributeValue::String(name.into()));
        engine.save(&mut person).unwrap();
    }

    let count = |operator: Operator, value: &str| {
        let mut query = Query::new("Person").with_criteria(QueryCriteria::new(
            "name",
            operator,
            AttributeValue::String(value.into()),
        ));
        engine.find(&mut query).unwrap().len()
    };

    assert_eq!(count(Operator::StartsWith, "Al"), 2);
    assert_eq!(count(Operator::Contains, "ber"), 1);
    assert_eq!(count(Operator::Like, "bob"), 1);
    assert_eq!(count(Operator::Matches, "^A.*t$"), 1);
    assert_eq!(count(Operator::NotStartsWith, "Al"), 1);
}

#[test]
fn test_subquery_matches_literal_list() {
    let engine = engine_with_people(&[4, 5, 6, 7, 8, 9]);

    let mut literal = Query::new("Person").with_criteria(QueryCriteria::new(
        "age",
        Operator::In,
        AttributeValue::List(vec![
            AttributeValue::Int(6),
            AttributeValue::Int(7),
            AttributeValue::Int(8),
            AttributeValue::Int(9),
        ]),
    ));

    // id IN (select id where age > 5) must behave like the literal id list
    let sub = Query::new("Person").with_criteria(QueryCriteria::new(
        "age",
        Operator::GreaterThan,
        AttributeValue::Int(5),
    ));
    let mut nested =
        Query::new("Person").with_criteria(QueryCriteria::new("id", Operator::In, sub));

    assert_eq!(
        ages_of(&engine.find(&mut literal).unwrap()),
        ages_of(&engine.find(&mut nested).unwrap())
    );
}

#[test]
fn test_subquery_with_selection() {
    let engine = engine_with_people(&[4, 9]);
    // select the age attribute itself out of the sub-query
    let sub = Query::new("Person")
        .with_criteria(QueryCriteria::new(
            "age",
            Operator::GreaterThan,
            AttributeValue::Int(5),
        ))
        .select("age");
    let mut query = Query::new("Person").with_criteria(QueryCriteria::new(
        "age",
        Operator::In,
        sub,
    ));
    assert_eq!(ages_of(&engine.find(&mut query).unwrap()), vec![9]);
}

#[test]
fn test_partition_routing() {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();
    engine.add_partition("eu");
    engine.add_partition("us");

    for (region, age) in [("eu", 1), ("eu", 2), ("us", 3)] {
        let mut person = Entity::new("Person")
            .set("age", AttributeValue::Int(age))
            .set("region", AttributeValue::String(region.into()));
        engine.save(&mut person).unwrap();
    }

    let mut eu_query = Query::new("Person").in_partition("eu");
    assert_eq!(engine.find(&mut eu_query).unwrap().len(), 2);

    let mut all_query = Query::new("Person").for_all_partitions();
    assert_eq!(engine.find(&mut all_query).unwrap().len(), 3);

    // A top-level equality on the partition attribute pins the target
    let mut derived = Query::new("Person").with_criteria(QueryCriteria::new(
        "region",
        Operator::Equal,
        AttributeValue::String("us".into()),
    ));
    let results = engine.find(&mut derived).unwrap();
    assert_eq!(derived.partition, PartitionTarget::Value("us".into()));
    assert_eq!(ages_of(&results), vec![3]);

    // Unknown partition values match nothing
    let mut unknown = Query::new("Person").in_partition("apac");
    assert!(engine.find(&mut unknown).unwrap().is_empty());
}

#[test]
fn test_unregistered_partition_value_only_reachable_by_fan_out() {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();

    // "mars" was never registered, so the record lands in partition 0
    let mut person = Entity::new("Person")
        .set("age", AttributeValue::Int(1))
        .set("region", AttributeValue::String("mars".into()));
    engine.save(&mut person).unwrap();

    // The equality criterion pins the derived target to the unknown value,
    // which matches nothing even though the attribute itself would match
    let mut derived = Query::new("Person").with_criteria(QueryCriteria::new(
        "region",
        Operator::Equal,
        AttributeValue::String("mars".into()),
    ));
    assert!(engine.find(&mut derived).unwrap().is_empty());

    // An explicit fan-out scan evaluates the same criterion and finds it
    let mut fan_out = Query::new("Person")
        .for_all_partitions()
        .with_criteria(QueryCriteria::new(
            "region",
            Operator::Equal,
            AttributeValue::String("mars".into()),
        ));
    assert_eq!(engine.find(&mut fan_out).unwrap().len(), 1);
}

#[test]
fn test_unpartitioned_records_live_in_partition_zero() {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();
    engine.add_partition("eu");

    let mut person = Entity::new("Person").set("age", AttributeValue::Int(1));
    engine.save(&mut person).unwrap();

    let mut eu_query = Query::new("Person").in_partition("eu");
    assert!(engine.find(&mut eu_query).unwrap().is_empty());
    let mut all_query = Query::new("Person");
    assert_eq!(engine.find(&mut all_query).unwrap().len(), 1);
}

#[test]
fn test_execute_update_coerces_and_refreshes_index() {
    let engine = engine_with_people(&[4, 5]);

    let mut update = Query::new("Person")
        .with_criteria(QueryCriteria::new(
            "age",
            Operator::Equal,
            AttributeValue::Int(4),
        ))
        .set("age", AttributeValue::String("6".into()));
    assert_eq!(engine.execute_update(&mut update).unwrap(), 1);

    let mut check = Query::new("Person").with_criteria(QueryCriteria::new(
        "age",
        Operator::Equal,
        AttributeValue::Int(6),
    ));
    assert_eq!(engine.find(&mut check).unwrap().len(), 1);

    let controller = engine
        .registry()
        .index_controller("Person", "idx_age")
        .unwrap();
    assert_eq!(controller.find(&AttributeValue::Int(4)).len(), 0);
    assert_eq!(controller.find(&AttributeValue::Int(6)).len(), 1);
}

#[test]
fn test_select_projection() {
    let engine = Engine::new();
    engine.register(person_descriptor()).unwrap();
    let mut person = Entity::new("Person").set("name", AttributeValue::String("Alice".into()));
    engine.save(&mut person).unwrap();

    let mut query = Query::new("Person")
        .select("upper(name)")
        .select("substring(name, 0, 2)");
    let rows = engine.select(&mut query).unwrap();
    assert_eq!(
        rows,
        vec![vec![
            AttributeValue::String("ALICE".into()),
            AttributeValue::String("Al".into()),
        ]]
    );
}

#[test]
fn test_count_and_paging_window() {
    let engine = engine_with_people(&[1, 2, 3, 4, 5]);

    let mut query = Query::new("Person");
    assert_eq!(engine.count(&mut query).unwrap(), 5);

    let mut page = Query::new("Person").first_row(3).max_results(10);
    let results = engine.find(&mut page).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(page.results_count, 5);

    let mut beyond = Query::new("Person").first_row(99);
    assert!(engine.find(&mut beyond).unwrap().is_empty());
    assert_eq!(beyond.results_count, 5);
}

proptest! {
    #[test]
    fn prop_threshold_query_matches_filter(ages in prop::collection::vec(0i64..100, 0..20), threshold in 0i64..100) {
        let engine = engine_with_people(&ages);
        let mut query = Query::new("Person").with_criteria(QueryCriteria::new(
            "age",
            Operator::GreaterThan,
            AttributeValue::Int(threshold),
        ));
        let mut found = ages_of(&engine.find(&mut query).unwrap());
        found.sort_unstable();
        let mut expected: Vec<i64> = ages.iter().copied().filter(|age| *age > threshold).collect();
        expected.sort_unstable();
        prop_assert_eq!(found, expected);
    }
}
