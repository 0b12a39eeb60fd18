//! Fixture graph for tests and benchmarks: persons with pets, movies and a
//! parent; movies with a category.
//!
//! With `n` persons, person `i` (0-based, id `i + 1`) has first name `F{i}`,
//! last name `L{n-1-i}` and the previous person as parent. It owns pets
//! `P{i*10}..P{i*10+9}` and movies `M{(n-1-i)*10}..M{(n-1-i)*10+9}`, and its
//! movies all belong to category `C{i}`.

use indoc::indoc;
use sqlx::{Pool, Postgres, QueryBuilder};

use crate::Result;
use crate::schema::{EntitySchema, Relation, SchemaRegistry, Through};

pub const PER_PERSON: i64 = 10;

const FIXTURE_DDL: &str = indoc! {r#"
    create table if not exists categories (
        id bigint primary key,
        name text not null
    );
    create table if not exists persons (
        id bigint primary key,
        "firstName" text not null,
        "lastName" text not null,
        age int not null,
        pid bigint references persons (id)
    );
    create table if not exists movies (
        id bigint primary key,
        name text not null,
        "categoryId" bigint references categories (id)
    );
    create table if not exists pets (
        id bigint primary key,
        name text not null,
        "ownerId" bigint references persons (id)
    );
    create table if not exists person_movie (
        "personId" bigint not null references persons (id),
        "movieId" bigint not null references movies (id),
        primary key ("personId", "movieId")
    );
"#};

pub async fn migrate_fixture_schema(pool: &Pool<Postgres>) -> Result<()> {
    for stmt in FIXTURE_DDL.split(';') {
        let stmt = stmt.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(pool).await?;
        }
    }
    Ok(())
}

/// Creates the fixture tables and inserts `persons` persons with their
/// related rows.
pub async fn seed_fixture(pool: &Pool<Postgres>, persons: i64) -> Result<()> {
    migrate_fixture_schema(pool).await?;
    let ids: Vec<i64> = (0..persons).collect();

    let mut categories = QueryBuilder::<Postgres>::new("insert into categories (id, name) ");
    categories.push_values(&ids, |mut b, i| {
        b.push_bind(i + 1).push_bind(format!("C{i:02}"));
    });
    categories.build().execute(pool).await?;

    let mut people =
        QueryBuilder::<Postgres>::new(r#"insert into persons (id, "firstName", "lastName", age, pid) "#);
    people.push_values(&ids, |mut b, i| {
        b.push_bind(i + 1)
            .push_bind(format!("F{i:02}"))
            .push_bind(format!("L{:02}", persons - 1 - i))
            .push_bind(20 + *i as i32)
            .push_bind(if *i == 0 { None } else { Some(*i) });
    });
    people.build().execute(pool).await?;

    let owned: Vec<(i64, i64)> = ids
        .iter()
        .flat_map(|i| (0..PER_PERSON).map(move |j| (*i, j)))
        .collect();

    let mut pets = QueryBuilder::<Postgres>::new(r#"insert into pets (id, name, "ownerId") "#);
    pets.push_values(&owned, |mut b, (i, j)| {
        b.push_bind(i * PER_PERSON + j + 1)
            .push_bind(format!("P{:02}", i * PER_PERSON + j))
            .push_bind(i + 1);
    });
    pets.build().execute(pool).await?;

    let mut movies = QueryBuilder::<Postgres>::new(r#"insert into movies (id, name, "categoryId") "#);
    movies.push_values(&owned, |mut b, (i, j)| {
        b.push_bind(i * PER_PERSON + j + 1)
            .push_bind(format!("M{:02}", (persons - 1 - i) * PER_PERSON + j))
            .push_bind(i + 1);
    });
    movies.build().execute(pool).await?;

    let mut links =
        QueryBuilder::<Postgres>::new(r#"insert into person_movie ("personId", "movieId") "#);
    links.push_values(&owned, |mut b, (i, j)| {
        b.push_bind(i + 1).push_bind(i * PER_PERSON + j + 1);
    });
    links.build().execute(pool).await?;

    Ok(())
}

/// Schema describing the fixture tables, with their key columns typed.
pub fn fixture_schema() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(
            EntitySchema::new("Person", "persons")
                .column_type("id", "bigint")
                .column_type("pid", "bigint")
                .relation(
                    "movies",
                    Relation::many_to_many(
                        "Movie",
                        "id",
                        Through::new("person_movie", "personId", "movieId"),
                        "id",
                    ),
                )
                .relation("pets", Relation::has_many("Animal", "id", "ownerId"))
                .relation("parent", Relation::belongs_to_one("Person", "pid", "id"))
                .relation("children", Relation::has_many("Person", "id", "pid")),
        )
        .with(
            EntitySchema::new("Movie", "movies")
                .column_type("id", "bigint")
                .column_type("categoryId", "bigint")
                .relation("category", Relation::belongs_to_one("Category", "categoryId", "id"))
                .relation(
                    "actors",
                    Relation::many_to_many(
                        "Person",
                        "id",
                        Through::new("person_movie", "movieId", "personId"),
                        "id",
                    ),
                ),
        )
        .with(
            EntitySchema::new("Animal", "pets")
                .columns(["id", "name", "ownerId"])
                .column_type("id", "bigint")
                .column_type("ownerId", "bigint")
                .relation("owner", Relation::belongs_to_one("Person", "ownerId", "id")),
        )
        .with(
            EntitySchema::new("Category", "categories")
                .column_type("id", "bigint")
                .relation("movies", Relation::has_many("Movie", "id", "categoryId")),
        )
}
