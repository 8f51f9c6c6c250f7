use std::future::Future;

use crate::form::{FieldName, FormEngine, FormHelpers, FormResult, ValidationError, Value, ValueMap};

use super::engine::UploadEngine;
use super::state::{FilePayload, UploadOutcome};
use super::transport::UploadTransport;

/// One file field waiting on an upload before the form can submit.
pub struct PendingUpload<'a, T>
where
    T: UploadTransport,
{
    pub field: FieldName,
    pub files: Vec<FilePayload>,
    pub engine: &'a UploadEngine<T>,
}

impl<'a, T> PendingUpload<'a, T>
where
    T: UploadTransport,
{
    pub fn new(
        field: impl Into<FieldName>,
        files: Vec<FilePayload>,
        engine: &'a UploadEngine<T>,
    ) -> Self {
        Self {
            field: field.into(),
            files,
            engine,
        }
    }
}

impl<E> FormEngine<E>
where
    E: ValidationError,
{
    /// Writes a settled upload's token(s) into a field: a single token as a
    /// string, several as an ordered array. Raw write, no validation trigger.
    pub fn attach_upload_outcome(
        &self,
        field: impl Into<FieldName>,
        outcome: &UploadOutcome,
    ) -> FormResult<()> {
        let value = match outcome {
            UploadOutcome::Single(token) => Value::String(token.clone()),
            UploadOutcome::Many(tokens) => {
                Value::Array(tokens.iter().cloned().map(Value::String).collect())
            }
        };
        self.write_field_value(&field.into(), value)
    }

    /// Runs each pending upload to completion in order, injects the resulting
    /// tokens into the form's values, then submits. An upload failure is
    /// returned as-is and the submit handler never runs.
    pub async fn submit_with_uploads<T, F, Fut>(
        &self,
        uploads: Vec<PendingUpload<'_, T>>,
        handler: F,
    ) -> anyhow::Result<()>
    where
        T: UploadTransport,
        F: FnOnce(ValueMap, FormHelpers<E>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        for pending in uploads {
            let outcome = pending.engine.upload(pending.files).await?;
            self.attach_upload_outcome(pending.field, &outcome)?;
        }
        self.handle_submit(handler).await
    }
}
