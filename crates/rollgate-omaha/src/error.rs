use thiserror::Error;

#[derive(Debug, Error)]
pub enum OmahaError {
    #[error("malformed omaha request: {0}")]
    Decode(#[from] quick_xml::DeError),

    #[error("encoding omaha response: {0}")]
    Encode(#[from] quick_xml::SeError),
}
