use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::WithRejection;
use futures::stream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::debug;

use crate::{
    AppState,
    error::{AppError, AppResult},
    models::{
        ALL, CATEGORIES, DownloadLinkQuery, GENRES, LIVE_CATEGORIES, LIVE_DEFAULT_LIMIT, LiveMovie,
        LiveQuery, LiveSearchRequest, LiveSearchResults, MovieFiles, MovieRecord, ResolvedLink,
        SearchFilters, SearchQuery, SearchRequest, SearchResults, TargetFilename, TargetMovie,
    },
    resolver::{LinkResolver, search_all},
};

// Extractor failures are reported through `AppError` like everything else.
type JsonBody<T> = WithRejection<Json<T>, AppError>;
type QueryParams<T> = WithRejection<Query<T>, AppError>;
type PathParam<T> = WithRejection<Path<T>, AppError>;

const NDJSON: &str = "application/x-ndjson";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/search", post(live_search))
        .route("/v1/search/stream", post(live_search_stream))
        .route("/v1/metadata", post(movie_metadata))
        .route("/v1/download-link", post(live_download_link))
        .route("/v2/search", get(search).post(search_post))
        .route("/v2/search/stream", post(search_stream))
        .route("/v2/movie/{id}", get(movie))
        .route("/v2/download-link/{id}", get(download_link))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

/// Query-through search against the site, trimmed by `offset` after `limit`.
pub async fn live_search(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(req), _): JsonBody<LiveSearchRequest>,
) -> AppResult<Json<LiveSearchResults>> {
    let offset = to_usize(req.offset);
    let (query, limit) = validate_live_search(req, state.config.search_limit_per_query)?;
    let resolver = state.resolver.as_ref();

    let mut movies = state.retry.run(resolver, || search_all(resolver, &query, limit)).await?;
    if movies.len() > offset {
        movies = movies.split_off(offset);
    }
    Ok(Json(LiveSearchResults { movies }))
}

/// One NDJSON line per site results page until `limit` hits are sent.
pub async fn live_search_stream(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(req), _): JsonBody<LiveSearchRequest>,
) -> AppResult<Response> {
    let (query, limit) = validate_live_search(req, state.config.search_stream_limit_per_query)?;
    debug!(query = %query.query, limit = limit, "streaming live search");

    let pages = stream::try_unfold((1u32, 0usize, HashSet::new()), move |(page, sent, mut seen)| {
        let state = state.clone();
        let query = query.clone();
        async move {
            if sent >= limit {
                return Ok::<_, AppError>(None);
            }
            let resolver = state.resolver.as_ref();
            let found = state.retry.run(resolver, || resolver.search(&query, page)).await?;

            let movies: Vec<LiveMovie> = found
                .into_iter()
                .filter(|m| seen.insert(m.url.clone()))
                .take(limit - sent)
                .collect();
            if movies.is_empty() {
                return Ok(None);
            }

            let sent = sent + movies.len();
            let line = ndjson_line(&LiveSearchResults { movies })?;
            Ok(Some((line, (page + 1, sent, seen))))
        }
    });

    Ok(([(CONTENT_TYPE, NDJSON)], Body::from_stream(pages)).into_response())
}

pub async fn movie_metadata(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(target), _): JsonBody<TargetMovie>,
) -> AppResult<Json<MovieFiles>> {
    let page_url = validate_url("movie_page_url", &target.movie_page_url)?;
    let resolver = state.resolver.as_ref();
    let files = state.retry.run(resolver, || resolver.list_files(page_url)).await?;
    Ok(Json(MovieFiles { files }))
}

pub async fn live_download_link(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(target), _): JsonBody<TargetFilename>,
) -> AppResult<Json<ResolvedLink>> {
    let file_url = validate_url("filename_url", &target.filename_url)?;
    let resolver = state.resolver.as_ref();
    let link = state.retry.run(resolver, || resolver.finalize(file_url)).await?;
    Ok(Json(link))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    WithRejection(Query(q), _): QueryParams<SearchQuery>,
) -> AppResult<Json<SearchResults>> {
    run_search(&state, q.into()).await
}

pub async fn search_post(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(req), _): JsonBody<SearchRequest>,
) -> AppResult<Json<SearchResults>> {
    run_search(&state, req).await
}

async fn run_search(state: &AppState, req: SearchRequest) -> AppResult<Json<SearchResults>> {
    let (filters, limit, offset) = validate_search(req, state.config.search_limit_per_query)?;
    let movies = state.catalog.search(&filters, limit, offset).await?;
    Ok(Json(SearchResults { movies }))
}

/// Newline-delimited `SearchResults` pages.
pub async fn search_stream(
    State(state): State<Arc<AppState>>,
    WithRejection(Json(req), _): JsonBody<SearchRequest>,
) -> AppResult<Response> {
    let (filters, total, _) = validate_search(req, state.config.search_stream_limit_per_query)?;
    let page_size = state.config.search_limit_per_query;
    let catalog = state.catalog.clone();
    let filters = Arc::new(filters);

    debug!(total = total, page_size = page_size, "streaming search");

    let pages = stream::try_unfold(0u64, move |fetched| {
        let catalog = catalog.clone();
        let filters = filters.clone();
        async move {
            if fetched >= total {
                return Ok::<_, AppError>(None);
            }
            let take = page_size.min(total - fetched);
            let movies: Vec<MovieRecord> = catalog.search_page(&filters, fetched, take).await?;
            if movies.is_empty() {
                return Ok(None);
            }

            let got = movies.len() as u64;
            let line = ndjson_line(&SearchResults { movies })?;

            let next = if got < take { total } else { fetched + got };
            Ok(Some((line, next)))
        }
    });

    Ok(([(CONTENT_TYPE, NDJSON)], Body::from_stream(pages)).into_response())
}

pub async fn movie(
    State(state): State<Arc<AppState>>,
    WithRejection(Path(id), _): PathParam<i32>,
) -> AppResult<Json<MovieRecord>> {
    state
        .catalog
        .get_movie(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("movie {id} does not exist")))
}

pub async fn download_link(
    State(state): State<Arc<AppState>>,
    WithRejection(Path(id), _): PathParam<i32>,
    WithRejection(Query(q), _): QueryParams<DownloadLinkQuery>,
) -> AppResult<Json<ResolvedLink>> {
    if state.catalog.page_url(id).await?.is_none() {
        return Err(AppError::NotFound(format!("movie {id} does not exist")));
    }

    let link = state
        .retry
        .run(state.resolver.as_ref(), || state.cache.resolve(id, q.quality))
        .await?;
    Ok(Json(link))
}

fn ndjson_line(page: &impl serde::Serialize) -> AppResult<String> {
    let mut line = serde_json::to_string(page).map_err(|e| AppError::Internal(e.into()))?;
    line.push('\n');
    Ok(line)
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

impl From<SearchQuery> for SearchRequest {
    fn from(q: SearchQuery) -> Self {
        Self {
            query: q.q,
            genres: q.genre.into_iter().collect(),
            category: q.category,
            year: q.year,
            year_offset: q.year_offset,
            distributions: q.distribution.into_iter().collect(),
            description: q.description,
            limit: q.limit,
            offset: q.offset,
            index: q.index,
        }
    }
}

fn validate_search(req: SearchRequest, max_limit: u64) -> AppResult<(SearchFilters, u64, u64)> {
    let limit = req.limit.unwrap_or(max_limit);
    if limit == 0 {
        return Err(AppError::validation("limit must be greater than 0"));
    }
    if limit > max_limit {
        return Err(AppError::validation(format!(
            "Search limit value exceeds total possible limit set per query {max_limit} - {limit}"
        )));
    }

    let category = match non_blank(req.category) {
        Some(c) if c == ALL => None,
        Some(c) if CATEGORIES.contains(&c.as_str()) => Some(c),
        Some(c) => return Err(AppError::validation(format!("unknown category {c:?}"))),
        None => None,
    };

    let mut genres = Vec::new();
    for genre in req.genres {
        let genre = genre.trim();
        if genre.is_empty() || genre == ALL {
            continue;
        }
        if !GENRES.contains(&genre) {
            return Err(AppError::validation(format!("unknown genre {genre:?}")));
        }
        genres.push(genre.to_string());
    }

    let distributions = req
        .distributions
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty() && d != ALL)
        .collect();

    let filters = SearchFilters {
        title: non_blank(req.query),
        year: req.year.filter(|y| *y != 0),
        year_after: req.year_offset.filter(|y| *y != 0),
        genres,
        category,
        distributions,
        description: non_blank(req.description),
        after_id: req.index.filter(|i| *i != 0),
    };

    Ok((filters, limit, req.offset))
}

fn validate_live_search(req: LiveSearchRequest, max_limit: u64) -> AppResult<(LiveQuery, usize)> {
    let query = req.q.trim().to_string();
    if query.is_empty() {
        return Err(AppError::validation("q must not be empty"));
    }

    let limit = req.limit.unwrap_or(LIVE_DEFAULT_LIMIT.min(max_limit));
    if limit == 0 {
        return Err(AppError::validation("limit must be greater than 0"));
    }
    if limit > max_limit {
        return Err(AppError::validation(format!(
            "Search limit value exceeds total possible limit set per query {max_limit} - {limit}"
        )));
    }

    let category = non_blank(req.category).unwrap_or_else(|| ALL.to_string());
    if !LIVE_CATEGORIES.contains(&category.as_str()) {
        return Err(AppError::validation(format!("unknown category {category:?}")));
    }

    Ok((LiveQuery { query, searchby: req.searchby, category }, to_usize(limit)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_url<'a>(field: &str, url: &'a str) -> AppResult<&'a str> {
    let url = url.trim();
    let host = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"));
    match host {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(url),
        _ => Err(AppError::validation(format!("{field}: invalid url {url:?}"))),
    }
}
