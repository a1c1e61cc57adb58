use std::fmt;

/// Classifies a filter pipeline abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterAbortKind {
    /// The filter aborted without a more specific reason.
    Generic,
    /// The filter ran out of storage space.
    ExceededStorage,
    /// The filter hit a formatting problem in the data contents.
    DataFormatError,
}

impl FilterAbortKind {
    /// Stable label for logs.
    pub fn label(self) -> &'static str {
        match self {
            FilterAbortKind::Generic => "FILTER_ABORT",
            FilterAbortKind::ExceededStorage => "FILTER_ABORT_EXCEEDED_STORAGE",
            FilterAbortKind::DataFormatError => "FILTER_ABORT_DATA_FORMAT_ERROR",
        }
    }
}

/// The status of an endpoint operation, either in flight or final.
///
/// Standard outcomes are closed variants; transport-specific failures use
/// [`Status::Extension`] with a numeric code and a static label, the same
/// way the OS errno is paired with a short description string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed successfully.
    Success,
    /// The operation did not finish before its deadline.
    TimedOut,
    /// The operation category is disabled (e.g. manual receive while a
    /// receive callback owns the receive category).
    Disabled,
    /// A destroy interrupted and canceled the operation.
    CanceledInDestroy,
    /// The endpoint is not open, or `open_status` reporting "not open".
    NotOpen,
    /// `open` was called on an already-open endpoint (use `reopen`).
    FailedAlreadyOpen,
    /// `open` was called without arguments and no prior arguments exist.
    NoPriorOpenArgs,
    /// The operation was installed but no transport hook has seen it yet.
    StartNewOp,
    /// The operation is being worked on.
    InProgress,
    /// A receive callback was supplied to a raw (non-threadsafe) endpoint.
    RecvCallbackNotValidInRaw,
    /// The supplied receive callback container is not usable.
    InvalidRecvCallback,
    /// The transport produced more bytes than the receive buffer holds.
    RecvDataTooLarge,
    /// The filter pipeline aborted; carries the offending filter's name.
    FilterAbort {
        /// Why the pipeline aborted.
        kind: FilterAbortKind,
        /// Name of the filter that aborted.
        filter: &'static str,
    },
    /// A filter emitted more bytes than the user's receive buffer holds.
    FilterOutputSizeOverRxMax {
        /// Name of the filter whose output did not fit.
        filter: &'static str,
    },
    /// A filter left shared storage non-empty when new input was required.
    FilterStorageNotConsumed {
        /// Name of the filter that did not consume its storage.
        filter: &'static str,
    },
    /// Transport-specific error with a numeric code and a static label.
    Extension {
        /// Transport-defined error code (commonly an errno value).
        code: u32,
        /// Short static description of the code.
        label: &'static str,
    },
}

impl Status {
    /// True if the operation finished successfully.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// True while the operation has not yet reached a final status.
    pub fn is_operating(self) -> bool {
        matches!(self, Status::StartNewOp | Status::InProgress)
    }

    /// Stable, human-readable label for the status kind.
    pub fn label(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::TimedOut => "TIMED_OUT",
            Status::Disabled => "DISABLED",
            Status::CanceledInDestroy => "CANCELED_IN_DESTROY",
            Status::NotOpen => "NOT_OPEN",
            Status::FailedAlreadyOpen => "FAILED_ALREADY_OPEN",
            Status::NoPriorOpenArgs => "NO_PRIOR_OPEN_ARGS",
            Status::StartNewOp => "START_NEW_OP",
            Status::InProgress => "IN_PROGRESS",
            Status::RecvCallbackNotValidInRaw => "RECV_CALLBACK_NOT_VALID_IN_RAW",
            Status::InvalidRecvCallback => "INVALID_RECV_CALLBACK",
            Status::RecvDataTooLarge => "RECV_DATA_TOO_LARGE",
            Status::FilterAbort { kind, .. } => kind.label(),
            Status::FilterOutputSizeOverRxMax { .. } => "FILTER_OUTPUT_SIZE_OVER_RX_MAX",
            Status::FilterStorageNotConsumed { .. } => "FILTER_STORAGE_NOT_CONSUMED",
            Status::Extension { label, .. } => label,
        }
    }

    /// Additional context beyond the label: the offending filter's name for
    /// pipeline failures, the extension label for transport errors, and an
    /// empty sentinel otherwise. Never absent.
    pub fn additional_info(self) -> &'static str {
        match self {
            Status::FilterAbort { filter, .. }
            | Status::FilterOutputSizeOverRxMax { filter }
            | Status::FilterStorageNotConsumed { filter } => filter,
            Status::Extension { label, .. } => label,
            _ => "",
        }
    }

    /// The numeric error code for [`Status::Extension`] statuses.
    pub fn code(self) -> Option<u32> {
        match self {
            Status::Extension { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Converts the status into a `Result`, treating anything other than
    /// [`Status::Success`] as an error.
    pub fn ok(self) -> Result<(), StatusError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(StatusError(self))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.additional_info();
        if info.is_empty() || info == self.label() {
            write!(f, "{}", self.label())
        } else {
            write!(f, "{} ({})", self.label(), info)
        }
    }
}

/// A non-success [`Status`] wrapped as a standard error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation failed: {0}")]
pub struct StatusError(pub Status);
