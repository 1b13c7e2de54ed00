use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Toml(#[from] toml::de::Error),

    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
}

impl Error {
    /// Point at the line in the config file that didn't parse.
    pub fn config(source: &str, err: toml::de::Error) -> Self {
        if let Some(span) = err.span() {
            let line = source[..span.start.min(source.len())]
                .chars()
                .filter(|c| *c == '\n')
                .count()
                + 1;
            Self::Syntax {
                line,
                message: err.message().to_string(),
            }
        } else {
            Self::Toml(err)
        }
    }
}
