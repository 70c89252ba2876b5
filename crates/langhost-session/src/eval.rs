//! Evaluation operations on top of a session.

use langhost_core::{
    CancelScope, DataTable, EvaluationResult, HostError, HostReply, HostRequest, HostResult,
    OutputSink, ResultKind, SessionId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

/// Metadata about the connected host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub session: SessionId,
    pub version: String,
    pub remote: bool,
}

/// Code execution and evaluation against a session's host.
///
/// Holds nothing but the session handle. Every operation except
/// [`Evaluator::host_info`] is a foreground interaction and waits its turn
/// behind earlier ones.
#[derive(Debug, Clone)]
pub struct Evaluator {
    session: Session,
}

impl Evaluator {
    /// Create a new evaluator for `session`.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Run `code` for its side effects.
    ///
    /// # Errors
    /// Returns [`HostError::Evaluation`] if the code fails, plus the usual
    /// cancellation and disconnection errors.
    pub async fn execute(&self, code: &str, scope: &CancelScope) -> HostResult<()> {
        let reply = self.session.request(execute_request(code), scope).await?;
        expect_ack(reply)
    }

    /// Run `code`, streaming its console output to `output`.
    ///
    /// # Errors
    /// See [`Evaluator::execute`].
    pub async fn execute_with_output(
        &self,
        code: &str,
        scope: &CancelScope,
        output: OutputSink,
    ) -> HostResult<()> {
        let reply = self
            .session
            .request_with_output(execute_request(code), scope, output)
            .await?;
        expect_ack(reply)
    }

    /// Evaluate `expr` and return its value in the requested shape.
    ///
    /// A failing expression is an [`EvaluationResult::Error`], not an `Err`.
    ///
    /// # Errors
    /// Returns cancellation, disconnection and protocol errors.
    pub async fn evaluate(
        &self,
        expr: &str,
        kind: ResultKind,
        scope: &CancelScope,
    ) -> HostResult<EvaluationResult> {
        let reply = self
            .session
            .request(evaluate_request(expr, kind), scope)
            .await?;
        into_result(reply)
    }

    /// Evaluate `expr`, streaming its console output to `output`.
    ///
    /// # Errors
    /// See [`Evaluator::evaluate`].
    pub async fn evaluate_with_output(
        &self,
        expr: &str,
        kind: ResultKind,
        scope: &CancelScope,
        output: OutputSink,
    ) -> HostResult<EvaluationResult> {
        let reply = self
            .session
            .request_with_output(evaluate_request(expr, kind), scope, output)
            .await?;
        into_result(reply)
    }

    /// Evaluate `expr` and convert the value into `T`.
    ///
    /// # Errors
    /// Returns [`HostError::Evaluation`] if the expression fails and
    /// [`HostError::Format`] if the value does not fit `T`.
    pub async fn evaluate_typed<T: DeserializeOwned>(
        &self,
        expr: &str,
        scope: &CancelScope,
    ) -> HostResult<T> {
        self.evaluate(expr, ResultKind::Structured, scope)
            .await?
            .into_typed()
    }

    /// Call `function` with JSON arguments.
    ///
    /// # Errors
    /// Returns cancellation, disconnection and protocol errors.
    pub async fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
        scope: &CancelScope,
    ) -> HostResult<EvaluationResult> {
        let request = HostRequest::Invoke {
            function: function.to_string(),
            args,
        };
        into_result(self.session.request(request, scope).await?)
    }

    /// Evaluate `expr` as a list of `T`.
    ///
    /// `NULL` yields an empty list and a scalar a one-element list.
    ///
    /// # Errors
    /// See [`Evaluator::evaluate_typed`].
    pub async fn fetch_list<T: DeserializeOwned>(
        &self,
        expr: &str,
        scope: &CancelScope,
    ) -> HostResult<Vec<T>> {
        let value: Value = self.evaluate_typed(expr, scope).await?;
        let items = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            scalar => vec![scalar],
        };
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| HostError::Format(format!("cannot convert list item: {e}")))
            })
            .collect()
    }

    /// Evaluate `expr` as a table.
    ///
    /// # Errors
    /// See [`Evaluator::evaluate_typed`].
    pub async fn fetch_table(&self, expr: &str, scope: &CancelScope) -> HostResult<DataTable> {
        let table: DataTable = self.evaluate_typed(expr, scope).await?;
        if let Some(row) = table.rows.iter().find(|row| row.len() != table.columns.len()) {
            return Err(HostError::Format(format!(
                "row has {} cells for {} columns",
                row.len(),
                table.columns.len()
            )));
        }
        Ok(table)
    }

    /// Render `expr` as an image of `width`x`height` pixels at `dpi`.
    ///
    /// # Errors
    /// Returns [`HostError::Evaluation`] if the expression fails and
    /// [`HostError::Protocol`] for invalid dimensions.
    pub async fn plot(
        &self,
        expr: &str,
        width: u32,
        height: u32,
        dpi: u32,
        scope: &CancelScope,
    ) -> HostResult<Vec<u8>> {
        let request = HostRequest::Plot {
            expr: expr.to_string(),
            width,
            height,
            dpi,
        };
        match into_result(self.session.request(request, scope).await?)? {
            EvaluationResult::Raw(image) => Ok(image),
            EvaluationResult::Error { message, .. } => Err(HostError::Evaluation { message }),
            EvaluationResult::Structured(_) => Err(HostError::Protocol(
                "plot returned a structured value".to_string(),
            )),
        }
    }

    /// Query host metadata. Does not wait behind foreground work.
    ///
    /// # Errors
    /// Returns cancellation and disconnection errors.
    pub async fn host_info(&self, scope: &CancelScope) -> HostResult<HostInfo> {
        match self.session.request(HostRequest::Handshake, scope).await? {
            HostReply::Handshake { version } => Ok(HostInfo {
                session: self.session.id(),
                version,
                remote: self.session.is_remote(),
            }),
            other => Err(unexpected(&other)),
        }
    }
}

fn execute_request(code: &str) -> HostRequest {
    HostRequest::Execute {
        code: code.to_string(),
    }
}

fn evaluate_request(expr: &str, kind: ResultKind) -> HostRequest {
    HostRequest::Evaluate {
        expr: expr.to_string(),
        kind,
    }
}

fn expect_ack(reply: HostReply) -> HostResult<()> {
    match reply {
        HostReply::Ack => Ok(()),
        HostReply::EvalError { message, .. } => Err(HostError::Evaluation { message }),
        other => Err(unexpected(&other)),
    }
}

fn into_result(reply: HostReply) -> HostResult<EvaluationResult> {
    match reply {
        HostReply::Value { value } => Ok(EvaluationResult::Structured(value)),
        HostReply::Raw { data } => Ok(EvaluationResult::Raw(data)),
        HostReply::EvalError { message, category } => {
            Ok(EvaluationResult::Error { message, category })
        }
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &HostReply) -> HostError {
    HostError::Protocol(format!("unexpected reply: {reply:?}"))
}
