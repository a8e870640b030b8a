//! Wire-format field keys. Every record is one JSON object per line,
//! tagged by a `dt` discriminator; keys are abbreviated and expanded
//! server-side.

// Request headers.
pub const HEADER_UPLOAD_TIME: &str = "x-upload-time";
pub const HEADER_INSTALL_ID: &str = "x-install-id";

// Shared attributes.
pub const PARAM_UUID: &str = "u";
pub const PARAM_DATA_TYPE: &str = "dt";
pub const PARAM_CLIENT_TIME: &str = "ct";
pub const PARAM_SESSION_UUID: &str = "su";
pub const PARAM_ATTRIBUTES: &str = "attrs";
pub const PARAM_SESSION_ELAPSE_TIME: &str = "sl";

// Upload header (`dt` = "h").
pub const PARAM_PERSISTED_AT: &str = "pa";
pub const PARAM_SEQUENCE_NUMBER: &str = "seq";

// Header common attributes.
pub const PARAM_APP_KEY: &str = "au";
pub const PARAM_INSTALL_ID: &str = "iu";
pub const PARAM_JAILBROKEN: &str = "j";
pub const PARAM_LIBRARY_VERSION: &str = "lv";
pub const PARAM_APP_VERSION: &str = "av";
pub const PARAM_DEVICE_PLATFORM: &str = "dp";
pub const PARAM_DEVICE_MANUFACTURER: &str = "dma";
pub const PARAM_LOCALE_LANGUAGE: &str = "dll";
pub const PARAM_LOCALE_COUNTRY: &str = "dlc";
pub const PARAM_DEVICE_MODEL: &str = "dmo";
pub const PARAM_DEVICE_OS_VERSION: &str = "dov";
pub const PARAM_DEVICE_MEMORY: &str = "dmem";

// Session start (`dt` = "s").
pub const PARAM_SESSION_NUMBER: &str = "nth";

// Session close (`dt` = "c").
pub const PARAM_SESSION_ACTIVE: &str = "cta";
pub const PARAM_SESSION_TOTAL: &str = "ctl";
pub const PARAM_SESSION_SCREENFLOW: &str = "fl";

// Application event (`dt` = "e").
pub const PARAM_EVENT_NAME: &str = "n";
pub const PARAM_REPORT_ATTRIBUTES: &str = "rattrs";

// Application flow (`dt` = "f").
pub const PARAM_SESSION_START: &str = "ss";
pub const PARAM_NEW_FLOW_EVENTS: &str = "nw";
pub const PARAM_OLD_FLOW_EVENTS: &str = "od";

// Opt in/out (`dt` = "o"). Carries whether the user is opted OUT.
pub const PARAM_OPT_VALUE: &str = "out";
