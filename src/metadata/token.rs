//! Metadata tokens and the pending local-reference space.
//!
//! A [`Token`] is the final 32-bit handle the metadata emitter hands out. While a
//! compilation unit is still being parsed, references to members whose owner is
//! defined in the same unit cannot be resolved yet; those are represented by a
//! [`TokenRef::Pending`] carrying a [`LocalRef`] index into the session's pending
//! reference lists. Consumers match on the enum instead of testing reserved bits.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A metadata token representing a reference to a metadata table entry.
///
/// Tokens in .NET metadata consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// The token of the module itself (row 1 of the `Module` table)
    pub const MODULE: Token = Token(0x0000_0001);

    /// The null token
    pub const NIL: Token = Token(0);

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from its table id and row
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token points into `table`
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }

    /// Returns true if the token denotes a method definition or a member reference,
    /// the only tokens legal as event and property accessors.
    #[must_use]
    pub fn is_method_like(&self) -> bool {
        self.is_table(TableId::MethodDef) || self.is_table(TableId::MemberRef)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Metadata table identifiers used as the high byte of a [`Token`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    Field = 0x04,
    MethodDef = 0x06,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    CustomAttribute = 0x0C,
    DeclSecurity = 0x0E,
    StandAloneSig = 0x11,
    Event = 0x14,
    Property = 0x17,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    Assembly = 0x20,
    AssemblyRef = 0x23,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
    UserString = 0x70,
}

/// Index of a member reference that is local to the compilation unit and not yet
/// matched against its definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalRef {
    /// Index into the pending method reference list
    MethodRef(usize),
    /// Index into the pending field reference list
    FieldRef(usize),
    /// Index into the pending method specification list
    MethodSpec(usize),
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalRef::MethodRef(index) => write!(f, "local method ref #{index}"),
            LocalRef::FieldRef(index) => write!(f, "local field ref #{index}"),
            LocalRef::MethodSpec(index) => write!(f, "local method spec #{index}"),
        }
    }
}

/// A reference as the parser sees it: either already final or still pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenRef {
    /// A token assigned by the metadata emitter
    Final(Token),
    /// A local reference that is resolved after all definitions are emitted
    Pending(LocalRef),
}

impl TokenRef {
    /// Returns the final token, if this reference is not pending
    #[must_use]
    pub fn as_final(&self) -> Option<Token> {
        match self {
            TokenRef::Final(token) => Some(*token),
            TokenRef::Pending(_) => None,
        }
    }

    /// Returns true if the reference still waits for local resolution
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, TokenRef::Pending(_))
    }
}

impl From<Token> for TokenRef {
    fn from(token: Token) -> Self {
        TokenRef::Final(token)
    }
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenRef::Final(token) => write!(f, "{token}"),
            TokenRef::Pending(local) => write!(f, "{local}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_token_parts() {
        let token = Token(0x06000001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);

        let max_token = Token(0xFFFFFFFF);
        assert_eq!(max_token.table(), 0xFF);
        assert_eq!(max_token.row(), 0x00FFFFFF);
    }

    #[test]
    fn test_token_from_parts() {
        let token = Token::from_parts(TableId::TypeDef, 5);
        assert_eq!(token, Token(0x02000005));
        assert!(token.is_table(TableId::TypeDef));

        let user_string = Token::from_parts(TableId::UserString, 0x1234);
        assert_eq!(user_string.value(), 0x70001234);
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token::NIL.is_null());
        assert!(!Token::MODULE.is_null());
    }

    #[test]
    fn test_token_method_like() {
        assert!(Token(0x06000001).is_method_like());
        assert!(Token(0x0A000003).is_method_like());
        assert!(!Token(0x04000001).is_method_like());
        assert!(!Token(0x2B000001).is_method_like());
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", Token(0x06000001)), "0x06000001");
        let debug_str = format!("{:?}", Token(0x06000001));
        assert!(debug_str.contains("table: 0x06"));
        assert!(debug_str.contains("row: 1"));
    }

    #[test]
    fn test_token_hash() {
        let mut map = HashMap::new();
        map.insert(Token(0x06000001), "Method1");
        map.insert(Token(0x06000002), "Method2");
        assert_eq!(map.get(&Token(0x06000001)), Some(&"Method1"));
        assert_eq!(map.get(&Token(0x06000002)), Some(&"Method2"));
    }

    #[test]
    fn test_token_ref() {
        let fin: TokenRef = Token(0x0A000001).into();
        assert_eq!(fin.as_final(), Some(Token(0x0A000001)));
        assert!(!fin.is_pending());

        let pending = TokenRef::Pending(LocalRef::MethodRef(3));
        assert_eq!(pending.as_final(), None);
        assert!(pending.is_pending());
        assert_eq!(pending.to_string(), "local method ref #3");
    }

    #[test]
    fn test_pending_spaces_are_disjoint() {
        let method = TokenRef::Pending(LocalRef::MethodRef(0));
        let field = TokenRef::Pending(LocalRef::FieldRef(0));
        let spec = TokenRef::Pending(LocalRef::MethodSpec(0));
        assert_ne!(method, field);
        assert_ne!(field, spec);
        assert_ne!(method, spec);
    }
}
