pub mod envoyfilters;
pub mod istiorevisions;
