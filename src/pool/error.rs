/// Pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(anyhow::anyhow!("Failed to check out a channel: {}", err)),
        }
    }
}
