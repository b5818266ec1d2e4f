use weft::{ErrorKind, LogFormat, LoggingConfig, ThreadPoolBuilder, init_logging};

use std::time::Duration;

#[test]
fn test_init_logging_installs_once() {
    let config = LoggingConfig {
        level: "weft=trace".to_string(),
        format: LogFormat::Json,
        color: false,
    };

    init_logging(&config).unwrap();

    // Events from pool lifecycle and tasks go through the installed subscriber.
    let pool = ThreadPoolBuilder::new().name("logged").build().unwrap();
    assert_eq!(pool.exec(async { Ok(1) }).block(Duration::from_secs(5)), Ok(1));

    let error = init_logging(&LoggingConfig::default()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Config);
}
