//! SQLite persistence for dexops: pool setup, embedded migrations, and the
//! per-request `Session` every repository query runs on.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dexops_core::{NewPokemon, Pokemon, PokemonRef, StatBlock, StatRanking, TopQuery, TypeCount};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Connection, Row, Sqlite, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "dexops-storage";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://pokedex_ops.db";

const SELECT_POKEMON: &str = r#"
    SELECT id, name, height, weight,
           hp, attack, defense, special_attack, special_defense, speed,
           synced_at
      FROM pokemon
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("pokemon {id} ({name}) conflicts with an existing row")]
    Conflict { id: i64, name: String },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub pokemon: i64,
    pub types: i64,
    pub links: i64,
}

/// Owns the connection pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;
        info!(database_url = %config.database_url, "opened sqlite store");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store. The connection is never recycled,
    /// since closing it would drop the database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        debug!("migrations applied");
        Ok(())
    }

    /// Acquire a connection for the duration of one request or command.
    pub async fn session(&self) -> Result<Session, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Session { conn })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One pooled connection. Returned to the pool when dropped.
pub struct Session {
    conn: PoolConnection<Sqlite>,
}

impl Session {
    pub async fn find_pokemon(&mut self, id: i64) -> Result<Option<PokemonRef>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM pokemon WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(row.map(|r| pokemon_ref(&r)).transpose()?)
    }

    pub async fn find_pokemon_by_name(&mut self, name: &str) -> Result<Option<PokemonRef>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM pokemon WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(row.map(|r| pokemon_ref(&r)).transpose()?)
    }

    pub async fn get_pokemon(&mut self, id: i64) -> Result<Option<Pokemon>, StoreError> {
        let sql = format!("{SELECT_POKEMON} WHERE id = ?");
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
        else {
            return Ok(None);
        };

        let types = sqlx::query(
            r#"
            SELECT t.name
              FROM pokemon_types pt
              JOIN types t ON t.id = pt.type_id
             WHERE pt.pokemon_id = ?
             ORDER BY pt.slot
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.conn)
        .await?
        .iter()
        .map(|r| r.try_get::<String, _>("name"))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(pokemon_from_row(&row, types)?))
    }

    /// Insert a Pokemon with its types and links in one transaction.
    ///
    /// Types are created on first sight and reused afterwards. A duplicate id
    /// or name yields `StoreError::Conflict` and leaves nothing behind.
    pub async fn insert_pokemon(&mut self, pokemon: &NewPokemon, synced_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = Connection::begin(&mut *self.conn).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pokemon (id, name, height, weight,
                                 hp, attack, defense, special_attack, special_defense, speed,
                                 synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pokemon.id)
        .bind(&pokemon.name)
        .bind(pokemon.height)
        .bind(pokemon.weight)
        .bind(pokemon.stats.hp)
        .bind(pokemon.stats.attack)
        .bind(pokemon.stats.defense)
        .bind(pokemon.stats.special_attack)
        .bind(pokemon.stats.special_defense)
        .bind(pokemon.stats.speed)
        .bind(synced_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::Conflict {
                    id: pokemon.id,
                    name: pokemon.name.clone(),
                });
            }
            return Err(err.into());
        }

        for (slot, type_name) in pokemon.types.iter().enumerate() {
            let type_id = upsert_type(&mut tx, type_name).await?;
            sqlx::query(
                r#"
                INSERT INTO pokemon_types (pokemon_id, type_id, slot)
                VALUES (?, ?, ?)
                ON CONFLICT (pokemon_id, type_id) DO NOTHING
                "#,
            )
            .bind(pokemon.id)
            .bind(type_id)
            .bind(slot as i64 + 1)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(id = pokemon.id, name = %pokemon.name, types = pokemon.types.len(), "inserted pokemon");
        Ok(())
    }

    /// Every stored Pokemon with its type names, ordered by id.
    pub async fn list_pokemon(&mut self) -> Result<Vec<Pokemon>, StoreError> {
        let sql = format!("{SELECT_POKEMON} ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.conn)
            .await?;

        let links = sqlx::query(
            r#"
            SELECT pt.pokemon_id AS pokemon_id, t.name AS name
              FROM pokemon_types pt
              JOIN types t ON t.id = pt.type_id
             ORDER BY pt.pokemon_id, pt.slot
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;

        let mut types_by_pokemon: HashMap<i64, Vec<String>> = HashMap::new();
        for link in links {
            let pokemon_id: i64 = link.try_get("pokemon_id")?;
            types_by_pokemon
                .entry(pokemon_id)
                .or_default()
                .push(link.try_get("name")?);
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let types = types_by_pokemon.remove(&id).unwrap_or_default();
            out.push(pokemon_from_row(&row, types)?);
        }
        Ok(out)
    }

    /// Highest values first; nulls sort last and ties go to the lower id.
    pub async fn top_by_stat(&mut self, query: &TopQuery) -> Result<Vec<StatRanking>, StoreError> {
        // column comes from the StatField allow-list, never from user input
        let column = query.stat.column();
        let sql = format!(
            "SELECT id, name, {column} AS value FROM pokemon \
             ORDER BY {column} IS NULL, {column} DESC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(query.limit))
            .fetch_all(&mut *self.conn)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            out.push(StatRanking {
                rank: idx as u32 + 1,
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                stat: query.stat,
                value: row.try_get("value")?,
            });
        }
        Ok(out)
    }

    pub async fn type_distribution(&mut self) -> Result<Vec<TypeCount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.name AS name, COUNT(pt.pokemon_id) AS count
              FROM types t
              LEFT JOIN pokemon_types pt ON pt.type_id = t.id
             GROUP BY t.id, t.name
             ORDER BY count DESC, t.name ASC
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TypeCount {
                name: row.try_get("name")?,
                count: row.try_get("count")?,
            });
        }
        Ok(out)
    }

    pub async fn counts(&mut self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM pokemon)       AS pokemon,
                   (SELECT COUNT(*) FROM types)         AS types,
                   (SELECT COUNT(*) FROM pokemon_types) AS links
            "#,
        )
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(StoreCounts {
            pokemon: row.try_get("pokemon")?,
            types: row.try_get("types")?,
            links: row.try_get("links")?,
        })
    }
}

async fn upsert_type(conn: &mut SqliteConnection, name: &str) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO types (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT id FROM types WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    row.try_get("id")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.is_unique_violation() || db_err.message().contains("UNIQUE constraint failed");
    }
    false
}

fn pokemon_ref(row: &SqliteRow) -> Result<PokemonRef, sqlx::Error> {
    Ok(PokemonRef {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn pokemon_from_row(row: &SqliteRow, types: Vec<String>) -> Result<Pokemon, sqlx::Error> {
    Ok(Pokemon {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        height: row.try_get("height")?,
        weight: row.try_get("weight")?,
        stats: StatBlock {
            hp: row.try_get("hp")?,
            attack: row.try_get("attack")?,
            defense: row.try_get("defense")?,
            special_attack: row.try_get("special_attack")?,
            special_defense: row.try_get("special_defense")?,
            speed: row.try_get("speed")?,
        },
        types,
        synced_at: row.try_get("synced_at")?,
    })
}
