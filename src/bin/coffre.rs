use coffre::api;
use coffre::cleanup;
use coffre::conf::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let app = api::build_app(rocket::Config::figment()).ignite().await?;

    let pool = api::DbConn::get_one(&app)
        .await
        .ok_or("Cannot access connection pool")?;
    let root_path = app
        .state::<AppConfig>()
        .map(|config| config.root_path.clone())
        .ok_or("Cannot access app config")?;

    let web_server = async {
        app.launch().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    };

    let background_job = async {
        pool.run(move |c| {
            cleanup::cleanup_once(c, &root_path).map_err(|err| format!("{:?}", err))
        })
        .await?;
        Ok(())
    };

    futures::try_join!(web_server, background_job)?;

    Ok(())
}
