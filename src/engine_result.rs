//! Provisional transaction engine results.
//!
//! Each code carries the server's numeric value; the class is derived from
//! the numeric range and drives the submission state machine's fallback
//! branches.

use std::fmt;
use std::str::FromStr;

/// Error for unrecognized engine result strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEngineResult(pub String);

impl fmt::Display for UnknownEngineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown engine result {:?}", self.0)
    }
}

impl std::error::Error for UnknownEngineResult {}

macro_rules! engine_results {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// A provisional engine result code, named as on the wire.
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EngineResult {
            $($name,)+
        }

        impl EngineResult {
            /// The server's numeric value for this code.
            pub fn code(&self) -> i32 {
                match self {
                    $(Self::$name => $code,)+
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                }
            }
        }

        impl FromStr for EngineResult {
            type Err = UnknownEngineResult;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($name) => Ok(Self::$name),)+
                    other => Err(UnknownEngineResult(other.to_owned())),
                }
            }
        }
    };
}

engine_results! {
    // tel: local error, not applied, retry possible on another server
    telLOCAL_ERROR = -399,
    telBAD_DOMAIN = -398,
    telBAD_PATH_COUNT = -397,
    telBAD_PUBLIC_KEY = -396,
    telFAILED_PROCESSING = -395,
    telINSUF_FEE_P = -394,
    telNO_DST_PARTIAL = -393,
    telCAN_NOT_QUEUE = -392,
    telCAN_NOT_QUEUE_BALANCE = -391,
    telCAN_NOT_QUEUE_BLOCKS = -390,
    telCAN_NOT_QUEUE_BLOCKED = -389,
    telCAN_NOT_QUEUE_FEE = -388,
    telCAN_NOT_QUEUE_FULL = -387,
    // tem: malformed, can never succeed
    temMALFORMED = -299,
    temBAD_AMOUNT = -298,
    temBAD_CURRENCY = -297,
    temBAD_EXPIRATION = -296,
    temBAD_FEE = -295,
    temBAD_ISSUER = -294,
    temBAD_LIMIT = -293,
    temBAD_OFFER = -292,
    temBAD_PATH = -291,
    temBAD_PATH_LOOP = -290,
    temBAD_SEND_NATIVE_LIMIT = -289,
    temBAD_SEND_NATIVE_MAX = -288,
    temBAD_SEND_NATIVE_NO_DIRECT = -287,
    temBAD_SEND_NATIVE_PARTIAL = -286,
    temBAD_SEND_NATIVE_PATHS = -285,
    temBAD_SEQUENCE = -284,
    temBAD_SIGNATURE = -283,
    temBAD_SRC_ACCOUNT = -282,
    temBAD_TRANSFER_RATE = -281,
    temDST_IS_SRC = -280,
    temDST_NEEDED = -279,
    temINVALID = -278,
    temINVALID_FLAG = -277,
    temREDUNDANT = -276,
    temREDUNDANT_SEND_MAX = -275,
    temRIPPLE_EMPTY = -274,
    temDISABLED = -273,
    temUNCERTAIN = -272,
    temUNKNOWN = -271,
    // tef: failed in this ledger's view, could succeed later
    tefFAILURE = -199,
    tefALREADY = -198,
    tefBAD_ADD_AUTH = -197,
    tefBAD_AUTH = -196,
    tefBAD_LEDGER = -195,
    tefCREATED = -194,
    tefEXCEPTION = -193,
    tefINTERNAL = -192,
    tefNO_AUTH_REQUIRED = -191,
    tefPAST_SEQ = -190,
    tefWRONG_PRIOR = -189,
    tefMASTER_DISABLED = -188,
    tefMAX_LEDGER = -187,
    // ter: retry in a later ledger
    terRETRY = -99,
    terFUNDS_SPENT = -98,
    terINSUF_FEE_B = -97,
    terNO_ACCOUNT = -96,
    terNO_AUTH = -95,
    terNO_LINE = -94,
    terOWNERS = -93,
    terPRE_SEQ = -92,
    terLAST = -91,
    terNO_RIPPLE = -90,
    terQUEUED = -89,
    // tes: applied provisionally
    tesSUCCESS = 0,
    // tec: applied, fee claimed, no other effect
    tecCLAIM = 100,
    tecPATH_PARTIAL = 101,
    tecUNFUNDED_ADD = 102,
    tecUNFUNDED_OFFER = 103,
    tecUNFUNDED_PAYMENT = 104,
    tecFAILED_PROCESSING = 105,
    tecDIR_FULL = 121,
    tecINSUF_RESERVE_LINE = 122,
    tecINSUF_RESERVE_OFFER = 123,
    tecNO_DST = 124,
    tecNO_DST_INSUF_NATIVE = 125,
    tecNO_LINE_INSUF_RESERVE = 126,
    tecNO_LINE_REDUNDANT = 127,
    tecPATH_DRY = 128,
    tecUNFUNDED = 129,
    tecMASTER_DISABLED = 130,
    tecNO_REGULAR_KEY = 131,
    tecOWNERS = 132,
    tecNO_ISSUER = 133,
    tecNO_AUTH = 134,
    tecNO_LINE = 135,
    tecINSUFF_FEE = 136,
    tecFROZEN = 137,
    tecNO_TARGET = 138,
    tecNO_PERMISSION = 139,
    tecNO_ENTRY = 140,
    tecINSUFFICIENT_RESERVE = 141,
    tecNEED_MASTER_KEY = 142,
    tecDST_TAG_NEEDED = 143,
    tecINTERNAL = 144,
    tecOVERSIZE = 145,
    tecINVARIANT_FAILED = 147,
}

impl EngineResult {
    pub fn class(&self) -> ResultClass {
        ResultClass::from_code(self.code())
    }

    /// Applied provisionally with full intended effect.
    pub fn is_success(&self) -> bool {
        *self == EngineResult::tesSUCCESS
    }
}

impl fmt::Display for EngineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine result classes; each covers a contiguous numeric range.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultClass {
    telLOCAL_ERROR,
    temMALFORMED,
    tefFAILURE,
    terRETRY,
    tesSUCCESS,
    tecCLAIM,
}

impl ResultClass {
    pub fn from_code(code: i32) -> ResultClass {
        match code {
            -399..=-300 => ResultClass::telLOCAL_ERROR,
            -299..=-200 => ResultClass::temMALFORMED,
            -199..=-100 => ResultClass::tefFAILURE,
            -99..=-1 => ResultClass::terRETRY,
            0 => ResultClass::tesSUCCESS,
            _ => ResultClass::tecCLAIM,
        }
    }
}
