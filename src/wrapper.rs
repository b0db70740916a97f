pub(crate) mod rust_log {
    use std::{panic::Location, sync::Arc};

    use log::kv::{ToValue, Value};

    use crate::field::Field;

    /// Destination of the records emitted by the middlewares.
    #[derive(Clone, Default)]
    pub(crate) enum Sink {
        /// Logger installed with `log::set_logger`.
        #[default]
        Global,
        Custom(Arc<dyn log::Log>),
    }

    impl Sink {
        pub(crate) fn get(&self) -> &dyn log::Log {
            match self {
                Sink::Global => log::logger(),
                Sink::Custom(logger) => logger.as_ref(),
            }
        }
    }

    impl std::fmt::Debug for Sink {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Sink::Global => f.write_str("Global"),
                Sink::Custom(_) => f.write_str("Custom"),
            }
        }
    }

    /// Hand one record to `logger`. Caller metadata is attached only when `loc` is set.
    pub(crate) fn log(
        logger: &dyn log::Log,
        level: log::Level,
        target: &str,
        module_path: &'static str,
        loc: Option<&'static Location<'static>>,
        message: &str,
        kv_fields: &[Field],
    ) {
        let kvs: Vec<(&str, Value)> = kv_fields
            .iter()
            .map(|field| (field.key(), field.value().to_value()))
            .collect();
        let kvs = kvs.as_slice();

        logger.log(
            &log::Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(target)
                .module_path_static(loc.map(|_| module_path))
                .file_static(loc.map(|loc| loc.file()))
                .line(loc.map(|loc| loc.line()))
                .key_values(&kvs)
                .build(),
        );
    }
}
