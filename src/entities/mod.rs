pub mod category;
pub mod download_link_best;
pub mod download_link_normal;
pub mod genre;
pub mod movie;
pub mod movie_genre;
