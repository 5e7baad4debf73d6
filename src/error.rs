use thiserror::Error;

use crate::flow::FieldId;

#[derive(Error, Debug, PartialEq)]
pub enum ClassifierError {
    #[error("segment boundaries must be strictly ascending word offsets inside the flow")]
    BadSegments,
    #[error("at most 3 prefix fields may be configured")]
    TooManyPrefixFields,
    #[error("field {0:?} is not prefix eligible")]
    NotPrefixEligible(FieldId),
    #[error("field {0:?} configured twice")]
    DuplicatePrefixField(FieldId),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
