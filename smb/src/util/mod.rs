pub(crate) mod flags_helper;
