use crate::protocol::ClientError;

/// How a body stream is consumed or produced.
///
/// A stream starts [`Mode::Undecided`] and commits to one mode on first use: a
/// blocking read or write commits it to [`Mode::Synchronous`], registering a listener
/// commits it to [`Mode::Asynchronous`]. The mode never changes afterwards.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Undecided,
    Synchronous,
    Asynchronous,
}

impl Mode {
    /// Commits to `requested` when still undecided, otherwise checks `requested` is the committed mode.
    pub fn commit(&mut self, requested: Mode) -> Result<(), ClientError> {
        match *self {
            Mode::Undecided => {
                *self = requested;
                Ok(())
            }
            current if current == requested => Ok(()),
            current => Err(ClientError::body_stream(format!("stream is in {current:?} mode, {requested:?} use is not allowed"))),
        }
    }

    #[inline]
    pub fn is_undecided(self) -> bool {
        self == Mode::Undecided
    }

    #[inline]
    pub fn is_asynchronous(self) -> bool {
        self == Mode::Asynchronous
    }

    #[inline]
    pub fn is_synchronous(self) -> bool {
        self == Mode::Synchronous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_once() {
        let mut mode = Mode::default();
        assert!(mode.is_undecided());

        mode.commit(Mode::Asynchronous).unwrap();
        assert!(mode.is_asynchronous());
        mode.commit(Mode::Asynchronous).unwrap();

        let error = mode.commit(Mode::Synchronous).unwrap_err();
        assert!(matches!(error, ClientError::BodyStream { .. }));
        assert!(mode.is_asynchronous());
    }
}
