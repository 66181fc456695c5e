use chrono::Utc;
use cmmsnotify::APP_NAME;
use cmmsnotify::app::FirebaseApp;
use cmmsnotify::functions::{Invocation, dispatch};
use jluszcz_rust_utils::lambda;
use lambda_runtime::{LambdaEvent, service_fn};
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    lambda::init(APP_NAME, module_path!(), false).await?;

    let app = FirebaseApp::from_env().await?;
    let app = &app;
    let func = service_fn(move |event: LambdaEvent<Value>| async move { handler(app, event).await });
    lambda_runtime::run(func).await?;
    Ok(())
}

async fn handler(app: &FirebaseApp, event: LambdaEvent<Value>) -> Result<Value, lambda_runtime::Error> {
    let invocation: Invocation = serde_json::from_value(event.payload)?;
    Ok(dispatch(app, invocation, Utc::now()).await?)
}
