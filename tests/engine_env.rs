use convkit::backend::{ENGINE_ENV_VAR, Engine, default_engine, engine_from_env, set_default_engine};

#[test]
fn test_engine_names_and_environment() {
    assert_eq!("AVX".parse::<Engine>().unwrap(), Engine::Avx);
    assert_eq!(" libdnn ".parse::<Engine>().unwrap(), Engine::Libdnn);
    assert!("cuda".parse::<Engine>().is_err());
    assert_eq!(Engine::Nnpack.to_string(), "NNPACK");

    // SAFETY: this binary runs a single test, so nothing reads the
    // environment concurrently.
    unsafe { std::env::set_var(ENGINE_ENV_VAR, "nnpack") };
    assert_eq!(engine_from_env(), Some(Engine::Nnpack));
    unsafe { std::env::set_var(ENGINE_ENV_VAR, "tpu") };
    assert_eq!(engine_from_env(), None);
    unsafe { std::env::remove_var(ENGINE_ENV_VAR) };
    assert_eq!(engine_from_env(), None);

    set_default_engine(Engine::Nnpack);
    assert_eq!(default_engine(), Engine::Nnpack);
    set_default_engine(Engine::default());
}
