//! Stacks, blue/green slots and route identifiers.
//!
//! Internally everything is a tagged enum. The compact string forms
//! (`"1ib"` for stack 1 / internal / blue, `"2g"` for stack 2 / green) are
//! only produced and parsed at the boundaries: DNS record set identifiers
//! and the persisted state document. They must stay byte-compatible with
//! records provisioned by earlier releases.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A compact identifier that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier {input:?}: {reason}")]
pub struct IdentifierError {
    pub input: String,
    pub reason: &'static str,
}

impl IdentifierError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

// ── Stack ──────────────────────────────────────────────────────────

/// One of N parallel deployment slots sharing the DNS weight.
///
/// Numbered from 1; rendered as the bare number (`"1"`, `"2"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Stack(u32);

impl Stack {
    /// The stack that receives the weight remainder.
    pub const FIRST: Stack = Stack(1);

    /// Build a stack from its number. Zero is not a stack.
    pub fn new(number: u32) -> Option<Self> {
        (number > 0).then_some(Self(number))
    }

    pub fn number(self) -> u32 {
        self.0
    }

    /// Stacks `1..=count`.
    pub fn all(count: u32) -> impl Iterator<Item = Stack> {
        (1..=count).map(Stack)
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Stack {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u32 = s
            .parse()
            .map_err(|_| IdentifierError::new(s, "stack must be a positive integer"))?;
        Stack::new(number).ok_or_else(|| IdentifierError::new(s, "stack numbers start at 1"))
    }
}

impl TryFrom<String> for Stack {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Stack> for String {
    fn from(stack: Stack) -> Self {
        stack.to_string()
    }
}

// ── DeploymentStack ───────────────────────────────────────────────

/// The two alternating environments inside a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStack {
    Blue,
    Green,
}

impl DeploymentStack {
    pub const ALL: [DeploymentStack; 2] = [DeploymentStack::Blue, DeploymentStack::Green];

    /// The other environment of the same stack.
    pub fn sister(self) -> Self {
        match self {
            DeploymentStack::Blue => DeploymentStack::Green,
            DeploymentStack::Green => DeploymentStack::Blue,
        }
    }

    pub fn code(self) -> char {
        match self {
            DeploymentStack::Blue => 'b',
            DeploymentStack::Green => 'g',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'b' => Some(DeploymentStack::Blue),
            'g' => Some(DeploymentStack::Green),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStack::Blue => write!(f, "blue"),
            DeploymentStack::Green => write!(f, "green"),
        }
    }
}

// ── RouteType ─────────────────────────────────────────────────────

/// Independent DNS namespaces that can each route to a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    #[serde(alias = "private")]
    Internal,
    #[serde(alias = "public")]
    External,
}

impl RouteType {
    pub const ALL: [RouteType; 2] = [RouteType::Internal, RouteType::External];

    pub fn code(self) -> char {
        match self {
            RouteType::Internal => 'i',
            RouteType::External => 'e',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(RouteType::Internal),
            'e' => Some(RouteType::External),
            _ => None,
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteType::Internal => write!(f, "internal"),
            RouteType::External => write!(f, "external"),
        }
    }
}

// ── Slot ──────────────────────────────────────────────────────────

/// A stack's blue or green environment; owns one compute group.
///
/// Encoded as `<stack><b|g>`, e.g. `"1b"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slot {
    pub stack: Stack,
    pub deployment_stack: DeploymentStack,
}

impl Slot {
    pub fn new(stack: Stack, deployment_stack: DeploymentStack) -> Self {
        Self {
            stack,
            deployment_stack,
        }
    }

    /// The route identifier of this slot in the given namespace.
    pub fn route(self, route_type: RouteType) -> RouteIdentifier {
        RouteIdentifier::new(self.stack, route_type, self.deployment_stack)
    }

    pub fn sister(self) -> Self {
        Self::new(self.stack, self.deployment_stack.sister())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.stack, self.deployment_stack.code())
    }
}

impl FromStr for Slot {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let ds = chars
            .next_back()
            .and_then(DeploymentStack::from_code)
            .ok_or_else(|| IdentifierError::new(s, "slot must end in 'b' or 'g'"))?;
        let stack = chars
            .as_str()
            .parse()
            .map_err(|_| IdentifierError::new(s, "slot must start with a stack number"))?;
        Ok(Slot::new(stack, ds))
    }
}

impl TryFrom<String> for Slot {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Slot> for String {
    fn from(slot: Slot) -> Self {
        slot.to_string()
    }
}

// ── RouteIdentifier ───────────────────────────────────────────────

/// Stack × RouteType × DeploymentStack.
///
/// Used as the weighted record's set identifier, e.g. `"1ib"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteIdentifier {
    pub stack: Stack,
    pub route_type: RouteType,
    pub deployment_stack: DeploymentStack,
}

impl RouteIdentifier {
    pub fn new(stack: Stack, route_type: RouteType, deployment_stack: DeploymentStack) -> Self {
        Self {
            stack,
            route_type,
            deployment_stack,
        }
    }

    pub fn slot(self) -> Slot {
        Slot::new(self.stack, self.deployment_stack)
    }

    pub fn sister(self) -> Self {
        Self::new(self.stack, self.route_type, self.deployment_stack.sister())
    }
}

impl fmt::Display for RouteIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.stack,
            self.route_type.code(),
            self.deployment_stack.code()
        )
    }
}

impl FromStr for RouteIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let ds = chars
            .next_back()
            .and_then(DeploymentStack::from_code)
            .ok_or_else(|| IdentifierError::new(s, "identifier must end in 'b' or 'g'"))?;
        let route_type = chars
            .next_back()
            .and_then(RouteType::from_code)
            .ok_or_else(|| IdentifierError::new(s, "route type must be 'i' or 'e'"))?;
        let stack = chars
            .as_str()
            .parse()
            .map_err(|_| IdentifierError::new(s, "identifier must start with a stack number"))?;
        Ok(RouteIdentifier::new(stack, route_type, ds))
    }
}

impl TryFrom<String> for RouteIdentifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RouteIdentifier> for String {
    fn from(id: RouteIdentifier) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(n: u32) -> Stack {
        Stack::new(n).unwrap()
    }

    #[test]
    fn route_identifier_uses_short_codes() {
        let id = RouteIdentifier::new(stack(1), RouteType::Internal, DeploymentStack::Blue);
        assert_eq!(id.to_string(), "1ib");

        let id = RouteIdentifier::new(stack(12), RouteType::External, DeploymentStack::Green);
        assert_eq!(id.to_string(), "12eg");
    }

    #[test]
    fn route_identifier_parses_multi_digit_stacks() {
        let id: RouteIdentifier = "12eg".parse().unwrap();
        assert_eq!(id.stack, stack(12));
        assert_eq!(id.route_type, RouteType::External);
        assert_eq!(id.deployment_stack, DeploymentStack::Green);
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert!("1xb".parse::<RouteIdentifier>().is_err());
        assert!("1iq".parse::<RouteIdentifier>().is_err());
        assert!("ib".parse::<RouteIdentifier>().is_err());
        assert!("0ib".parse::<RouteIdentifier>().is_err());
        assert!("".parse::<Slot>().is_err());
        assert!("b".parse::<Slot>().is_err());
    }

    #[test]
    fn slot_and_route_agree() {
        let slot: Slot = "3g".parse().unwrap();
        let route = slot.route(RouteType::Internal);
        assert_eq!(route.to_string(), "3ig");
        assert_eq!(route.slot(), slot);
        assert_eq!(slot.sister().to_string(), "3b");
    }

    #[test]
    fn identifiers_serialize_as_strings() {
        let id = RouteIdentifier::new(stack(2), RouteType::Internal, DeploymentStack::Green);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"2ig\"");
        let slot: Slot = serde_json::from_str("\"4b\"").unwrap();
        assert_eq!(slot, Slot::new(stack(4), DeploymentStack::Blue));
        assert_eq!(serde_json::to_string(&stack(7)).unwrap(), "\"7\"");
    }

    #[test]
    fn route_type_accepts_legacy_aliases() {
        let rt: RouteType = serde_json::from_str("\"private\"").unwrap();
        assert_eq!(rt, RouteType::Internal);
        let rt: RouteType = serde_json::from_str("\"public\"").unwrap();
        assert_eq!(rt, RouteType::External);
    }

    #[test]
    fn stacks_enumerate_from_one() {
        let stacks: Vec<String> = Stack::all(3).map(|s| s.to_string()).collect();
        assert_eq!(stacks, vec!["1", "2", "3"]);
        assert!(Stack::new(0).is_none());
    }
}
