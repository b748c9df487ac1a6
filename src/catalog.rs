use std::collections::HashMap;

use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
    sea_query::{Expr, Query},
};
use tracing::debug;

use crate::{
    entities::{category, genre, movie, movie_genre},
    models::{MovieRecord, SearchFilters},
};

/// Read-only view over the movie catalog.
#[derive(Clone)]
pub struct Catalog {
    db: DatabaseConnection,
}

impl Catalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_movie(&self, id: i32) -> Result<Option<MovieRecord>, DbErr> {
        let Some(found) = movie::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        Ok(self.hydrate(vec![found]).await?.pop())
    }

    pub async fn page_url(&self, id: i32) -> Result<Option<String>, DbErr> {
        let found = movie::Entity::find_by_id(id).one(&self.db).await?;
        Ok(found.map(|m| m.url))
    }

    /// Filtered search in id order. `offset` trims the already limited rows,
    /// and only when more than `offset` rows came back.
    pub async fn search(
        &self,
        filters: &SearchFilters,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<MovieRecord>, DbErr> {
        let mut rows = movie::Entity::find()
            .filter(condition(filters))
            .order_by_asc(movie::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;

        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if rows.len() > offset {
            rows = rows.split_off(offset);
        }

        debug!(results = rows.len(), limit = limit, offset = offset, "catalog search");
        self.hydrate(rows).await
    }

    /// Plain offset/limit window, used for streamed results.
    pub async fn search_page(
        &self,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<MovieRecord>, DbErr> {
        let rows = movie::Entity::find()
            .filter(condition(filters))
            .order_by_asc(movie::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.db)
            .await?;
        self.hydrate(rows).await
    }

    async fn hydrate(&self, rows: Vec<movie::Model>) -> Result<Vec<MovieRecord>, DbErr> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let categories: HashMap<i32, String> = category::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();

        let ids: Vec<i32> = rows.iter().map(|m| m.id).collect();
        let links = movie_genre::Entity::find()
            .filter(movie_genre::Column::MovieId.is_in(ids))
            .order_by_asc(movie_genre::Column::GenreId)
            .find_also_related(genre::Entity)
            .all(&self.db)
            .await?;

        let mut genres: HashMap<i32, Vec<String>> = HashMap::new();
        for (link, found) in links {
            if let Some(g) = found {
                genres.entry(link.movie_id).or_default().push(g.name);
            }
        }

        Ok(rows
            .into_iter()
            .map(|m| MovieRecord {
                category: categories.get(&m.category_id).cloned().unwrap_or_default(),
                genres: genres.remove(&m.id).unwrap_or_default(),
                id: m.id,
                title: m.title,
                year: m.year,
                distribution: m.distribution,
                description: m.description,
                url: m.url,
                cover_photo: m.cover_photo,
            })
            .collect())
    }
}

fn condition(filters: &SearchFilters) -> Condition {
    let mut cond = Condition::all();

    if let Some(title) = &filters.title {
        cond = cond.add(movie::Column::Title.contains(title));
    }
    if let Some(year) = filters.year {
        cond = cond.add(movie::Column::Year.eq(year));
    }
    if let Some(year) = filters.year_after {
        cond = cond.add(movie::Column::Year.gt(year));
    }
    if let Some(description) = &filters.description {
        cond = cond.add(movie::Column::Description.contains(description));
    }
    if !filters.distributions.is_empty() {
        cond = cond.add(movie::Column::Distribution.is_in(filters.distributions.clone()));
    }
    if let Some(id) = filters.after_id {
        cond = cond.add(movie::Column::Id.gt(id));
    }
    if let Some(name) = &filters.category {
        let ids = Query::select()
            .column(category::Column::Id)
            .from(category::Entity)
            .and_where(category::Column::Name.eq(name.as_str()))
            .to_owned();
        cond = cond.add(movie::Column::CategoryId.in_subquery(ids));
    }
    if !filters.genres.is_empty() {
        let ids = Query::select()
            .column((movie_genre::Entity, movie_genre::Column::MovieId))
            .from(movie_genre::Entity)
            .inner_join(
                genre::Entity,
                Expr::col((genre::Entity, genre::Column::Id))
                    .equals((movie_genre::Entity, movie_genre::Column::GenreId)),
            )
            .and_where(genre::Column::Name.is_in(filters.genres.clone()))
            .to_owned();
        cond = cond.add(movie::Column::Id.in_subquery(ids));
    }

    cond
}
