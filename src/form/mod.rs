mod engine;
mod subscribe;
mod validation;


pub use engine::{
    FieldMeta, FieldName, FieldProps, FormEngine, FormError, FormHelpers, FormOptions, FormResult,
    FormSnapshot, FormStatus, RevalidateMode, ValidateMode, ValidationTicket, Value, ValueMap,
};
pub use subscribe::SubscriptionId;
pub use validation::{FieldValidator, ValidationError};
