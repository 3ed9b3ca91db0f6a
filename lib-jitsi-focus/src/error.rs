use xmpp_parsers::{
  stanza_error::{DefinedCondition, ErrorType, StanzaError},
  Element,
};

/// The stanza-error conditions the focus hands back to callers. Internal
/// faults stay `anyhow` errors until they reach an IQ boundary, where they
/// collapse into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorKind {
  BadRequest,
  NotAcceptable,
  NotAuthorized,
  Forbidden,
  NotAllowed,
  ItemNotFound,
  UnexpectedRequest,
  ResourceConstraint,
  ServiceUnavailable,
  FeatureNotImplemented,
  InternalServerError,
  Gone,
}

impl StanzaErrorKind {
  fn parts(self) -> (ErrorType, DefinedCondition) {
    match self {
      StanzaErrorKind::BadRequest => (ErrorType::Modify, DefinedCondition::BadRequest),
      StanzaErrorKind::NotAcceptable => (ErrorType::Modify, DefinedCondition::NotAcceptable),
      StanzaErrorKind::NotAuthorized => (ErrorType::Auth, DefinedCondition::NotAuthorized),
      StanzaErrorKind::Forbidden => (ErrorType::Auth, DefinedCondition::Forbidden),
      StanzaErrorKind::NotAllowed => (ErrorType::Cancel, DefinedCondition::NotAllowed),
      StanzaErrorKind::ItemNotFound => (ErrorType::Cancel, DefinedCondition::ItemNotFound),
      StanzaErrorKind::UnexpectedRequest => (ErrorType::Wait, DefinedCondition::UnexpectedRequest),
      StanzaErrorKind::ResourceConstraint => {
        (ErrorType::Wait, DefinedCondition::ResourceConstraint)
      },
      StanzaErrorKind::ServiceUnavailable => {
        (ErrorType::Cancel, DefinedCondition::ServiceUnavailable)
      },
      StanzaErrorKind::FeatureNotImplemented => {
        (ErrorType::Cancel, DefinedCondition::FeatureNotImplemented)
      },
      StanzaErrorKind::InternalServerError => {
        (ErrorType::Cancel, DefinedCondition::InternalServerError)
      },
      StanzaErrorKind::Gone => (ErrorType::Cancel, DefinedCondition::Gone),
    }
  }

  pub fn to_stanza_error(self, text: &str) -> StanzaError {
    let (error_type, condition) = self.parts();
    StanzaError::new(error_type, condition, "en", text)
  }

  /// As [`to_stanza_error`], with an application-specific extension element
  /// attached (e.g. `session-invalid`).
  pub fn to_stanza_error_with_extension(self, text: &str, extension: Element) -> StanzaError {
    let mut error = self.to_stanza_error(text);
    error.other = Some(extension);
    error
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn maps_to_defined_conditions() {
    let error = StanzaErrorKind::ResourceConstraint.to_stanza_error("no usable bridge");
    assert_eq!(error.defined_condition, DefinedCondition::ResourceConstraint);
    let error = StanzaErrorKind::BadRequest.to_stanza_error("missing action");
    assert_eq!(error.defined_condition, DefinedCondition::BadRequest);
  }

  #[test]
  fn carries_application_extension() {
    let extension: Element =
      "<session-invalid xmlns='http://jitsi.org/protocol/focus'/>".parse().unwrap();
    let error =
      StanzaErrorKind::NotAcceptable.to_stanza_error_with_extension("invalid session", extension);
    assert!(error.other.is_some());
  }
}
