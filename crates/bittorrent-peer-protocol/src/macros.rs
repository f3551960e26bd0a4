/// Returns [`crate::Error::BadLength`] from the enclosing function if `$v < $e`
macro_rules! check_length {
    ($v:expr, $e:expr) => {
        if $v < $e {
            return Err($crate::Error::BadLength($v, $e));
        }
    };
}
