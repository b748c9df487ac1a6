use std::fmt;

use serde::{Deserialize, Serialize};

/// Upstream lists file variants in a fixed order; the tier is the position.
pub const NORMAL_VARIANT_INDEX: usize = 0;
pub const BEST_VARIANT_INDEX: usize = 1;

pub const ALL: &str = "All";

pub const CATEGORIES: [&str; 2] = ["Bollywood", "Hollywood"];

/// Categories the site's own search accepts.
pub const LIVE_CATEGORIES: [&str; 4] = ["All", "Bollywood", "Hollywood", "DHollywood"];

pub const LIVE_DEFAULT_LIMIT: u64 = 20;

pub const GENRES: [&str; 22] = [
    "Action",
    "Adventure",
    "Animation",
    "Biography",
    "Comedy",
    "Crime",
    "Documentary",
    "Drama",
    "Family",
    "Fantasy",
    "Film-Noir",
    "History",
    "Horror",
    "Music",
    "Musical",
    "Mystery",
    "Romance",
    "Sci-Fi",
    "Sport",
    "Thriller",
    "War",
    "Western",
];

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Normal,
    Best,
}

impl Quality {
    pub fn variant_index(self) -> usize {
        match self {
            Quality::Normal => NORMAL_VARIANT_INDEX,
            Quality::Best => BEST_VARIANT_INDEX,
        }
    }

    pub fn pick(self, variants: &[FileVariant]) -> Option<&FileVariant> {
        variants.get(self.variant_index())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Normal => "normal",
            Quality::Best => "best",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable file listed on a movie page.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FileVariant {
    pub label: String,
    pub file_url: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub filename: String,
    pub url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MovieRecord {
    pub id: i32,
    pub title: String,
    pub year: Option<i32>,
    pub distribution: Option<String>,
    pub description: Option<String>,
    pub category: String,
    pub genres: Vec<String>,
    pub url: String,
    pub cover_photo: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchFilters {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub year_after: Option<i32>,
    pub genres: Vec<String>,
    pub category: Option<String>,
    pub distributions: Vec<String>,
    pub description: Option<String>,
    pub after_id: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub movies: Vec<MovieRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub genre: Option<String>,
    pub category: Option<String>,
    pub year: Option<i32>,
    pub year_offset: Option<i32>,
    pub description: Option<String>,
    pub distribution: Option<String>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    pub index: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub category: Option<String>,
    pub year: Option<i32>,
    pub year_offset: Option<i32>,
    #[serde(default)]
    pub distributions: Vec<String>,
    pub description: Option<String>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    pub index: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadLinkQuery {
    #[serde(default)]
    pub quality: Quality,
}

#[derive(Debug, Deserialize)]
pub struct TargetMovie {
    pub movie_page_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TargetFilename {
    pub filename_url: String,
}

#[derive(Debug, Serialize)]
pub struct MovieFiles {
    pub files: Vec<FileVariant>,
}

/// Which field the site's search matches `q` against.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SearchBy {
    #[default]
    Name,
    Director,
    Starcast,
}

impl SearchBy {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchBy::Name => "Name",
            SearchBy::Director => "Director",
            SearchBy::Starcast => "Starcast",
        }
    }
}

impl fmt::Display for SearchBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveSearchRequest {
    pub q: String,
    #[serde(default)]
    pub searchby: SearchBy,
    pub category: Option<String>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
}

/// A validated query against the site's search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveQuery {
    pub query: String,
    pub searchby: SearchBy,
    pub category: String,
}

/// A search hit as the site lists it; not stored in the catalog.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LiveMovie {
    pub title: String,
    pub url: String,
    pub year: Option<i32>,
    pub distribution: Option<String>,
    pub about: Option<String>,
    pub cover_photo: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LiveSearchResults {
    pub movies: Vec<LiveMovie>,
}
