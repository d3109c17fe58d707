// Query planner and explain output tests
use bookshelf_core::{Collection, Database, ExplainVerbosity, IndexSpec, SortDirection};
use serde_json::{json, Value};
use std::sync::Arc;

fn books() -> Arc<Collection> {
    let db = Database::in_memory();
    let books = db.collection("books").unwrap();
    for (title, author, year) in [
        ("Clean Code", "Robert C. Martin", 2008),
        ("Clean Architecture", "Robert C. Martin", 2017),
        ("The Clean Coder", "Robert C. Martin", 2011),
        ("Refactoring", "Martin Fowler", 1999),
        ("Refactoring", "Martin Fowler", 2018),
        ("Dune", "Frank Herbert", 1965),
    ] {
        books
            .insert_one(json!({"title": title, "author": author, "published_year": year}))
            .unwrap();
    }
    books
}

fn winning_plan(explain: &Value) -> &Value {
    &explain["queryPlanner"]["winningPlan"]
}

#[test]
fn test_collscan_without_indexes() {
    let books = books();
    let explain = books
        .explain(&json!({"title": "Clean Code"}), ExplainVerbosity::ExecutionStats)
        .unwrap();

    assert_eq!(explain["queryPlanner"]["namespace"], "bookshelf.books");
    assert_eq!(explain["queryPlanner"]["parsedQuery"], json!({"title": "Clean Code"}));
    assert_eq!(winning_plan(&explain)["stage"], "COLLSCAN");
    assert_eq!(explain["executionStats"]["executionSuccess"], true);
    assert_eq!(explain["executionStats"]["nReturned"], 1);
    assert_eq!(explain["executionStats"]["totalKeysExamined"], 0);
    assert_eq!(explain["executionStats"]["totalDocsExamined"], 6);
}

#[test]
fn test_title_lookup_uses_title_index() {
    let books = books();
    books.create_index(IndexSpec::ascending("title")).unwrap();

    let explain = books
        .explain(&json!({"title": "Clean Code"}), ExplainVerbosity::ExecutionStats)
        .unwrap();
    let plan = winning_plan(&explain);

    assert_eq!(plan["stage"], "IXSCAN");
    assert_eq!(plan["indexName"], "title_1");
    assert_eq!(plan["keyPattern"], json!({"title": 1}));
    assert_eq!(plan["indexBounds"]["title"], json!(["[\"Clean Code\", \"Clean Code\"]"]));
    assert_eq!(explain["executionStats"]["nReturned"], 1);
    assert_eq!(explain["executionStats"]["totalDocsExamined"], 1);
    assert_eq!(
        explain["queryPlanner"]["availableIndexes"].as_array().map(|a| a.len()),
        Some(2)
    );
}

#[test]
fn test_compound_index_bounds() {
    let books = books();
    books
        .create_index(IndexSpec::ascending("author").then("published_year", SortDirection::Descending))
        .unwrap();

    let filter = json!({"author": "Robert C. Martin", "published_year": {"$gt": 2010}});
    let explain = books.explain(&filter, ExplainVerbosity::ExecutionStats).unwrap();
    let plan = winning_plan(&explain);

    assert_eq!(plan["stage"], "IXSCAN");
    assert_eq!(plan["indexName"], "author_1_published_year_-1");
    assert_eq!(plan["keyPattern"], json!({"author": 1, "published_year": -1}));
    assert_eq!(explain["executionStats"]["nReturned"], 2);
    assert_eq!(explain["executionStats"]["totalDocsExamined"], 2);
    assert_eq!(explain["executionStats"]["totalKeysExamined"], 3);
}

#[test]
fn test_explain_agrees_with_find() {
    let books = books();
    books.create_index(IndexSpec::ascending("published_year")).unwrap();

    for filter in [
        json!({"published_year": {"$gte": 2000, "$lt": 2015}}),
        json!({"published_year": {"$in": [1965, 2018]}}),
        json!({"title": "Refactoring", "published_year": {"$gt": 2000}}),
        json!({"$or": [{"title": "Dune"}, {"published_year": 2017}]}),
    ] {
        let explain = books.explain(&filter, ExplainVerbosity::ExecutionStats).unwrap();
        let found = books.find(&filter).unwrap();
        assert_eq!(explain["executionStats"]["nReturned"], json!(found.len()), "{}", filter);
    }
}

#[test]
fn test_query_planner_verbosity_does_not_execute() {
    let books = books();
    let explain = books.explain(&json!({}), ExplainVerbosity::QueryPlanner).unwrap();
    assert!(explain.get("executionStats").is_none());
    assert_eq!(winning_plan(&explain)["stage"], "COLLSCAN");
    assert_eq!(ExplainVerbosity::parse("executionStats").unwrap(), ExplainVerbosity::ExecutionStats);
    assert!(ExplainVerbosity::parse("verbose").is_err());
}
