use std::{num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use wreq::header::{LOCATION, REFERER};

use crate::{
    models::{FileVariant, LiveMovie, LiveQuery, Quality, ResolvedLink},
    retry::StaleSession,
};

const MAX_REDIRECTS: usize = 10;
const FILE_VARIANT_SELECTOR: &str = "a[href*='downloadoptionskey']";
const DOWNLOAD_LINK_SELECTOR: &str = "a[href*='downloadkey']";
const DOWNLOAD_FLOW_MARKER: &str = "download";
const SEARCH_PATH: &str = "csearch.php";
const SEARCH_RESULT_SELECTOR: &str = "div.mainbox";
const SEARCH_LINK_SELECTOR: &str = "a[href*='movie-']";

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The site dropped the navigation context; resolution must restart
    /// from the movie page.
    #[error("resolver session expired")]
    SessionExpired { redirect_to: Option<String> },

    #[error("resolver request failed: {0}")]
    Network(String),

    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),

    #[error("no {quality} variant listed ({available} available)")]
    MissingVariant { quality: Quality, available: usize },

    #[error("resolver returned an empty link")]
    EmptyLink,

    #[error("unexpected resolver response: {0}")]
    Parse(String),
}

impl From<wreq::Error> for ResolveError {
    fn from(err: wreq::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl StaleSession for ResolveError {
    fn is_stale_session(&self) -> bool {
        matches!(self, ResolveError::SessionExpired { .. })
    }

    fn session_redirect(&self) -> Option<&str> {
        match self {
            ResolveError::SessionExpired { redirect_to } => redirect_to.as_deref(),
            _ => None,
        }
    }
}

/// Turns a movie page into downloadable files.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// File variants in the order the site lists them.
    async fn list_files(&self, page_url: &str) -> Result<Vec<FileVariant>, ResolveError>;

    /// Follows a listed file through to its direct, time-limited URL.
    async fn finalize(&self, file_url: &str) -> Result<ResolvedLink, ResolveError>;

    /// One page (1-based) of the site's own search. An empty page means
    /// there are no more results.
    async fn search(&self, query: &LiveQuery, page: u32) -> Result<Vec<LiveMovie>, ResolveError>;

    /// Visits `url` so the site re-issues the session cookies that an
    /// expired download flow needs.
    async fn refresh_session(&self, url: &str) -> Result<(), ResolveError>;
}

/// Walks search pages until `limit` movies are collected or the site runs
/// out. A page that only repeats earlier results ends the walk.
pub async fn search_all(
    resolver: &dyn LinkResolver,
    query: &LiveQuery,
    limit: usize,
) -> Result<Vec<LiveMovie>, ResolveError> {
    let mut movies: Vec<LiveMovie> = Vec::new();
    let mut page = 1;
    while movies.len() < limit {
        let found = resolver.search(query, page).await?;
        let before = movies.len();
        for movie in found {
            if movies.len() < limit && !movies.iter().any(|m| m.url == movie.url) {
                movies.push(movie);
            }
        }
        if movies.len() == before {
            break;
        }
        page += 1;
    }
    Ok(movies)
}

pub struct HttpLinkResolver {
    client: wreq::Client,
    base_url: String,
    referer: String,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

enum Hop {
    Redirect(String),
    Done(wreq::Response),
}

impl HttpLinkResolver {
    pub fn new(client: wreq::Client, base_url: &str, rps: u32) -> Self {
        let rps = NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
        let base_url = base_url.trim_end_matches('/').to_string();
        let referer = format!("{base_url}/");
        Self { client, base_url, referer, limiter }
    }

    async fn hop(&self, url: &str) -> Result<Hop, ResolveError> {
        self.limiter.until_ready().await;

        let resp = self.client.get(url).header(REFERER, &self.referer).send().await?;
        if resp.status().is_redirection() {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ResolveError::Parse(format!("redirect without location from {url}")))?;
            return Ok(Hop::Redirect(absolutize(url, location)));
        }

        Ok(Hop::Done(resp.error_for_status()?))
    }

    /// Fetches a page, following redirects. With `in_flow`, a redirect that
    /// leaves the download pages means the session is gone.
    async fn fetch_html(&self, url: &str, in_flow: bool) -> Result<(String, String), ResolveError> {
        let mut current = url.to_string();
        for _ in 0..MAX_REDIRECTS {
            match self.hop(&current).await? {
                Hop::Redirect(to) if in_flow && !to.contains(DOWNLOAD_FLOW_MARKER) => {
                    debug!(from = %current, to = %to, "redirected out of download flow");
                    return Err(ResolveError::SessionExpired { redirect_to: Some(to) });
                },
                Hop::Redirect(to) => current = to,
                Hop::Done(resp) => return Ok((current, resp.text().await?)),
            }
        }
        Err(ResolveError::Parse(format!("too many redirects from {url}")))
    }

    /// Last URL of a redirect chain. The body is never read.
    async fn last_url(&self, url: &str) -> Result<String, ResolveError> {
        let mut current = url.to_string();
        for _ in 0..MAX_REDIRECTS {
            match self.hop(&current).await? {
                Hop::Redirect(to) => current = to,
                Hop::Done(_) => return Ok(current),
            }
        }
        Err(ResolveError::Parse(format!("too many redirects from {url}")))
    }
}

#[async_trait]
impl LinkResolver for HttpLinkResolver {
    async fn list_files(&self, page_url: &str) -> Result<Vec<FileVariant>, ResolveError> {
        debug!(page_url = %page_url, "listing file variants");
        let (landing, html) = self.fetch_html(page_url, false).await?;
        let files = parse_file_variants(&html, &landing)?;
        debug!(page_url = %page_url, variants = files.len(), "parsed movie page");
        Ok(files)
    }

    async fn finalize(&self, file_url: &str) -> Result<ResolvedLink, ResolveError> {
        debug!(file_url = %file_url, "finalizing file");
        let (landing, html) = self.fetch_html(file_url, true).await?;

        // The site renders the file page without links once its session cookies are gone.
        let link = parse_download_link(&html, &landing)?
            .ok_or(ResolveError::SessionExpired { redirect_to: None })?;

        let url = self.last_url(&link).await?;
        let filename = filename_from_url(&url)
            .ok_or_else(|| ResolveError::Parse(format!("no filename in {url}")))?;

        debug!(file_url = %file_url, filename = %filename, "resolved direct link");
        Ok(ResolvedLink { filename, url })
    }

    async fn search(&self, query: &LiveQuery, page: u32) -> Result<Vec<LiveMovie>, ResolveError> {
        let url = format!("{}/{SEARCH_PATH}", self.base_url);
        let page_param = page.to_string();
        debug!(query = %query.query, searchby = %query.searchby, page = page, "searching site");

        self.limiter.until_ready().await;
        let resp = self
            .client
            .get(url.as_str())
            .header(REFERER, &self.referer)
            .query(&[
                ("searchname", query.query.as_str()),
                ("Search", "Search"),
                ("searchby", query.searchby.as_str()),
                ("category", query.category.as_str()),
                ("pg", page_param.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let html = resp.text().await?;

        parse_search_results(&html, &url)
    }

    async fn refresh_session(&self, url: &str) -> Result<(), ResolveError> {
        let url = absolutize(&self.referer, url);
        debug!(url = %url, "refreshing resolver session");
        self.fetch_html(&url, false).await.map(|_| ())
    }
}

fn selector(css: &str) -> Result<Selector, ResolveError> {
    Selector::parse(css).map_err(|e| ResolveError::Parse(e.to_string()))
}

fn parse_file_variants(html: &str, base: &str) -> Result<Vec<FileVariant>, ResolveError> {
    let doc = Html::parse_document(html);
    let selector = selector(FILE_VARIANT_SELECTOR)?;

    let mut out = Vec::new();
    for el in doc.select(&selector) {
        let Some(href) = el.value().attr("href") else { continue };
        let label = el.text().collect::<String>().trim().to_string();
        out.push(FileVariant { label, file_url: absolutize(base, href) });
    }
    Ok(out)
}

fn parse_download_link(html: &str, base: &str) -> Result<Option<String>, ResolveError> {
    let doc = Html::parse_document(html);
    let selector = selector(DOWNLOAD_LINK_SELECTOR)?;
    Ok(doc
        .select(&selector)
        .find_map(|el| el.value().attr("href"))
        .map(|href| absolutize(base, href.trim())))
}

fn parse_search_results(html: &str, base: &str) -> Result<Vec<LiveMovie>, ResolveError> {
    let doc = Html::parse_document(html);
    let boxes = selector(SEARCH_RESULT_SELECTOR)?;
    let links = selector(SEARCH_LINK_SELECTOR)?;
    let images = selector("img[src]")?;
    let smalls = selector("small")?;

    let mut out = Vec::new();
    for entry in doc.select(&boxes) {
        let Some(link) = entry
            .select(&links)
            .find(|a| !a.text().collect::<String>().trim().is_empty())
        else {
            continue;
        };
        let Some(href) = link.value().attr("href") else { continue };
        let title = link.text().collect::<String>().trim().to_string();

        let mut year = None;
        let mut details = Vec::new();
        for small in entry.select(&smalls) {
            let text = small.text().collect::<String>().trim().to_string();
            if text.is_empty() || text == title {
                continue;
            }
            match parse_year(&text) {
                Some(y) if year.is_none() => year = Some(y),
                _ => details.push(text),
            }
        }

        let mut details = details.into_iter();
        let distribution = details.next();
        let about = details.collect::<Vec<_>>().join(" ");

        out.push(LiveMovie {
            title,
            url: absolutize(base, href),
            year,
            distribution,
            about: (!about.is_empty()).then_some(about),
            cover_photo: entry
                .select(&images)
                .find_map(|img| img.value().attr("src"))
                .map(|src| absolutize(base, src)),
        });
    }
    Ok(out)
}

fn parse_year(text: &str) -> Option<i32> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    (inner.len() == 4).then(|| inner.parse().ok()).flatten()
}

fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }

    let scheme_end = base.find("://").map(|i| i + 3).unwrap_or(0);
    if let Some(rest) = href.strip_prefix("//") {
        return format!("{}{}", &base[..scheme_end], rest);
    }

    let origin_end =
        base[scheme_end..].find('/').map(|i| scheme_end + i).unwrap_or(base.len());
    if href.starts_with('/') {
        return format!("{}{}", &base[..origin_end], href);
    }

    let path = base.split(['?', '#']).next().unwrap_or(base);
    match path[origin_end.min(path.len())..].rfind('/') {
        Some(i) => format!("{}{}", &path[..origin_end + i + 1], href),
        None => format!("{}/{}", &path[..origin_end.min(path.len())], href),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOVIE_PAGE: &str = r#"
        <html><body>
          <ul class="moviesfiles">
            <li><a id="downloadoptionslink1" href="download1.php?downloadoptionskey=5-26561-aaa">Fast_and_Furious_7_BluRay.mp4</a></li>
            <li><a id="downloadoptionslink2" href="/download1.php?downloadoptionskey=5-26561-bbb"> Fast_and_Furious_7_BluRay_high.mp4 </a></li>
          </ul>
          <a href="/movieslist.php">More</a>
        </body></html>
    "#;

    #[test]
    fn file_variants_keep_page_order() {
        let files =
            parse_file_variants(MOVIE_PAGE, "https://fzmovies.net/movie-Fast--hmp4.htm").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].label, "Fast_and_Furious_7_BluRay.mp4");
        assert_eq!(
            files[0].file_url,
            "https://fzmovies.net/download1.php?downloadoptionskey=5-26561-aaa"
        );
        assert_eq!(files[1].label, "Fast_and_Furious_7_BluRay_high.mp4");
        assert_eq!(
            files[1].file_url,
            "https://fzmovies.net/download1.php?downloadoptionskey=5-26561-bbb"
        );
    }

    #[test]
    fn quality_maps_to_listing_position() {
        let files = parse_file_variants(MOVIE_PAGE, "https://fzmovies.net/x.htm").unwrap();
        assert!(Quality::Normal.pick(&files).unwrap().file_url.ends_with("aaa"));
        assert!(Quality::Best.pick(&files).unwrap().file_url.ends_with("bbb"));
        assert!(Quality::Best.pick(&files[..1]).is_none());
    }

    #[test]
    fn download_link_is_first_keyed_anchor() {
        let html = r#"<a href="download.php?downloadkey=k1">mirror 1</a>
                      <a href="download.php?downloadkey=k2">mirror 2</a>"#;
        let link = parse_download_link(html, "https://fzmovies.net/download1.php?x=1").unwrap();
        assert_eq!(link.as_deref(), Some("https://fzmovies.net/download.php?downloadkey=k1"));
        assert_eq!(parse_download_link("<p>expired</p>", "https://fzmovies.net/").unwrap(), None);
    }

    #[test]
    fn filename_comes_from_last_segment() {
        assert_eq!(
            filename_from_url("https://cdn.example/res/abc/Fast_7_high.mp4?fromwebsite").as_deref(),
            Some("Fast_7_high.mp4")
        );
        assert_eq!(filename_from_url("https://cdn.example/"), None);
    }

    #[test]
    fn absolutize_handles_relative_forms() {
        let base = "https://fzmovies.net/dir/page.htm?q=1";
        assert_eq!(absolutize(base, "https://other.net/a"), "https://other.net/a");
        assert_eq!(absolutize(base, "//cdn.net/a"), "https://cdn.net/a");
        assert_eq!(absolutize(base, "/root.php"), "https://fzmovies.net/root.php");
        assert_eq!(absolutize(base, "sibling.php"), "https://fzmovies.net/dir/sibling.php");
        assert_eq!(absolutize("https://fzmovies.net", "a.php"), "https://fzmovies.net/a.php");
    }

    #[test]
    fn only_session_expiry_is_stale() {
        assert!(ResolveError::SessionExpired { redirect_to: None }.is_stale_session());
        assert!(!ResolveError::Network("reset".into()).is_stale_session());
        assert!(!ResolveError::Timeout(Duration::from_secs(1)).is_stale_session());
    }

    #[test]
    fn session_redirect_is_exposed() {
        let err = ResolveError::SessionExpired { redirect_to: Some("https://fzmovies.net/".into()) };
        assert_eq!(err.session_redirect(), Some("https://fzmovies.net/"));
        assert_eq!(ResolveError::SessionExpired { redirect_to: None }.session_redirect(), None);
        assert_eq!(ResolveError::EmptyLink.session_redirect(), None);
    }

    const SEARCH_PAGE: &str = r#"
        <html><body>
          <div class="mainbox">
            <table><tr>
              <td><a href="movie-Fast%20and%20Furious%207--hmp4.htm"><img src="imdb_images/ff7.jpg" class="imgx"></a></td>
              <td><span>
                <a href="movie-Fast%20and%20Furious%207--hmp4.htm"><small><b>Fast and Furious 7</b></small></a><br>
                <small>(2015)</small><br>
                <small>BluRay</small><br>
                <small>Deckard Shaw seeks revenge.</small>
              </span></td>
            </tr></table>
          </div>
          <div class="mainbox">
            <table><tr><td><a href="movie-Wrong%20Turn--hmp4.htm"><small><b>Wrong Turn</b></small></a></td></tr></table>
          </div>
          <div class="mainbox"><p>advert</p></div>
        </body></html>
    "#;

    #[test]
    fn search_results_are_parsed_per_box() {
        let movies = parse_search_results(SEARCH_PAGE, "https://fzmovies.net/csearch.php").unwrap();
        assert_eq!(movies.len(), 2);

        let ff7 = &movies[0];
        assert_eq!(ff7.title, "Fast and Furious 7");
        assert_eq!(ff7.url, "https://fzmovies.net/movie-Fast%20and%20Furious%207--hmp4.htm");
        assert_eq!(ff7.year, Some(2015));
        assert_eq!(ff7.distribution.as_deref(), Some("BluRay"));
        assert_eq!(ff7.about.as_deref(), Some("Deckard Shaw seeks revenge."));
        assert_eq!(ff7.cover_photo.as_deref(), Some("https://fzmovies.net/imdb_images/ff7.jpg"));

        let wrong_turn = &movies[1];
        assert_eq!(wrong_turn.title, "Wrong Turn");
        assert_eq!(wrong_turn.year, None);
        assert_eq!(wrong_turn.cover_photo, None);
    }

    #[test]
    fn year_needs_parenthesized_four_digits() {
        assert_eq!(parse_year("(2015)"), Some(2015));
        assert_eq!(parse_year("2015"), None);
        assert_eq!(parse_year("(BluRay)"), None);
    }
}
