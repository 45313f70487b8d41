pub type Result<T> = ::std::result::Result<T, ::failure::Error>;

macro_rules! err_format {
    ($e:expr) => {
        ::failure::err_msg($e)
    };
    ($fmt:expr, $($arg:tt)+) => {
        ::failure::err_msg(format!($fmt, $($arg)+))
    };
}

/// Reports an unrecoverable contract breach. The message goes to the logging
/// sink first, so hosts keep a record even when the panic is caught at a
/// thread boundary (tests do exactly that).
macro_rules! critical {
    ($fmt:expr) => {{
        log::error!($fmt);
        panic!($fmt);
    }};
    ($fmt:expr, $($arg:tt)+) => {{
        log::error!($fmt, $($arg)+);
        panic!($fmt, $($arg)+);
    }};
}
