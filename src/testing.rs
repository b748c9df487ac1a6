//! Fixtures shared by the unit tests: a migrated temp-file database,
//! catalog seeding, and a call-counting resolver.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tempfile::TempDir;

use crate::{
    db,
    entities::{category, genre, movie, movie_genre},
    models::{FileVariant, LiveMovie, LiveQuery, ResolvedLink},
    resolver::{LinkResolver, ResolveError},
};

pub fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display())
}

pub async fn test_db() -> (TempDir, DatabaseConnection) {
    let dir = tempfile::tempdir().unwrap();
    let db = db::connect_and_migrate(&sqlite_url(&dir)).await.unwrap();
    (dir, db)
}

pub struct MovieSeed {
    id: i32,
    title: String,
    year: Option<i32>,
    category: String,
    genres: Vec<String>,
    distribution: Option<String>,
    description: Option<String>,
}

impl MovieSeed {
    pub fn new(id: i32, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            year: None,
            category: "Hollywood".to_string(),
            genres: Vec::new(),
            distribution: None,
            description: None,
        }
    }

    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn category(mut self, name: &str) -> Self {
        self.category = name.to_string();
        self
    }

    pub fn genres(mut self, names: &[&str]) -> Self {
        self.genres = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn distribution(mut self, distribution: &str) -> Self {
        self.distribution = Some(distribution.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

pub async fn seed_movie(db: &DatabaseConnection, seed: MovieSeed) {
    let category_id = match category::Entity::find()
        .filter(category::Column::Name.eq(seed.category.as_str()))
        .one(db)
        .await
        .unwrap()
    {
        Some(found) => found.id,
        None => {
            category::Entity::insert(category::ActiveModel {
                name: Set(seed.category.clone()),
                ..Default::default()
            })
            .exec(db)
            .await
            .unwrap()
            .last_insert_id
        },
    };

    movie::Entity::insert(movie::ActiveModel {
        id: Set(seed.id),
        title: Set(seed.title.clone()),
        year: Set(seed.year),
        distribution: Set(seed.distribution.clone()),
        description: Set(seed.description.clone()),
        category_id: Set(category_id),
        url: Set(format!("https://fzmovies.test/movie-{}.htm", seed.id)),
        cover_photo: Set(None),
    })
    .exec(db)
    .await
    .unwrap();

    for name in &seed.genres {
        let genre_id = match genre::Entity::find()
            .filter(genre::Column::Name.eq(name.as_str()))
            .one(db)
            .await
            .unwrap()
        {
            Some(found) => found.id,
            None => {
                genre::Entity::insert(genre::ActiveModel {
                    name: Set(name.clone()),
                    ..Default::default()
                })
                .exec(db)
                .await
                .unwrap()
                .last_insert_id
            },
        };

        movie_genre::Entity::insert(movie_genre::ActiveModel {
            movie_id: Set(seed.id),
            genre_id: Set(genre_id),
        })
        .exec_without_returning(db)
        .await
        .unwrap();
    }
}

/// Where the site's session restarts after it expires.
pub const SESSION_HOME: &str = "https://fzmovies.test/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    List,
    Finalize,
    Search,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Expired session that a visit to `SESSION_HOME` restores.
    StaleSession,
    /// Expired session that no refresh brings back.
    DeadSession,
    Network,
}

/// Lists two variants per page and hands out a new direct URL on every
/// finalize call, so refreshed rows are distinguishable. Search pages hold
/// three hits each, `search_pages` pages deep.
pub struct FakeResolver {
    list_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
    search_calls: AtomicUsize,
    variants: usize,
    search_pages: u32,
    failure: Mutex<Option<(Stage, Failure)>>,
    delay: Mutex<Option<(Stage, Duration)>>,
    refreshed: Mutex<Vec<String>>,
}

impl Default for FakeResolver {
    fn default() -> Self {
        Self {
            list_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            variants: 2,
            search_pages: 2,
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            refreshed: Mutex::new(Vec::new()),
        }
    }
}

impl FakeResolver {
    pub const HITS_PER_PAGE: usize = 3;

    pub fn with_variants(variants: usize) -> Self {
        Self { variants, ..Default::default() }
    }

    /// Number of resolutions started (movie pages listed).
    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().unwrap().clone()
    }

    /// Fails movie-page listing.
    pub fn fail_with(&self, failure: Option<Failure>) {
        self.fail_at(Stage::List, failure);
    }

    pub fn fail_at(&self, stage: Stage, failure: Option<Failure>) {
        *self.failure.lock().unwrap() = failure.map(|f| (stage, f));
    }

    /// Slows movie-page listing.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_at(Stage::List, delay);
    }

    pub fn delay_at(&self, stage: Stage, delay: Duration) {
        *self.delay.lock().unwrap() = Some((stage, delay));
    }

    async fn enter(&self, stage: Stage) -> Result<(), ResolveError> {
        let delay = *self.delay.lock().unwrap();
        if let Some((at, delay)) = delay {
            if at == stage {
                tokio::time::sleep(delay).await;
            }
        }

        let failure = *self.failure.lock().unwrap();
        match failure {
            Some((at, Failure::StaleSession | Failure::DeadSession)) if at == stage => {
                Err(ResolveError::SessionExpired { redirect_to: Some(SESSION_HOME.into()) })
            },
            Some((at, Failure::Network)) if at == stage => {
                Err(ResolveError::Network("connection reset".into()))
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LinkResolver for FakeResolver {
    async fn list_files(&self, page_url: &str) -> Result<Vec<FileVariant>, ResolveError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(Stage::List).await?;

        Ok((0..self.variants)
            .map(|i| FileVariant {
                label: format!("variant{i}.mp4"),
                file_url: format!("{page_url}#variant{i}"),
            })
            .collect())
    }

    async fn finalize(&self, file_url: &str) -> Result<ResolvedLink, ResolveError> {
        let generation = self.finalize_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.enter(Stage::Finalize).await?;

        let variant = file_url.rsplit('#').next().unwrap_or("variant");
        Ok(ResolvedLink {
            filename: format!("{variant}_{generation}.mp4"),
            url: format!("https://cdn.test/{variant}/{generation}"),
        })
    }

    async fn search(&self, query: &LiveQuery, page: u32) -> Result<Vec<LiveMovie>, ResolveError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(Stage::Search).await?;

        if page > self.search_pages {
            return Ok(Vec::new());
        }
        Ok((0..Self::HITS_PER_PAGE)
            .map(|i| LiveMovie {
                title: format!("{} {page}-{i}", query.query),
                url: format!("https://fzmovies.test/movie-{page}-{i}--hmp4.htm"),
                year: Some(2000 + page as i32),
                distribution: Some(query.searchby.to_string()),
                about: None,
                cover_photo: None,
            })
            .collect())
    }

    async fn refresh_session(&self, url: &str) -> Result<(), ResolveError> {
        self.refreshed.lock().unwrap().push(url.to_string());
        let mut failure = self.failure.lock().unwrap();
        if matches!(*failure, Some((_, Failure::StaleSession))) && url == SESSION_HOME {
            *failure = None;
        }
        Ok(())
    }
}
