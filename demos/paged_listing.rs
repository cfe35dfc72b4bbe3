//! Demonstrates a connection-string client listing settings page by page against a local mock
//! service, with sync tokens captured from the responses.

// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use serde::Deserialize;
// self
use resman_runtime::{
	client::{Client, ClientOptions},
	http::Method,
	pager::PageShape,
};

#[derive(Debug, Deserialize)]
struct Setting {
	key: String,
	value: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let first = server
		.mock_async(|when, then| {
			when.method(GET).path("/kv").query_param("api-version", "2023-10-01");
			then.status(200)
				.header("content-type", "application/json")
				.header("sync-token", "zAJw6V16=MDoyOA==;sn=28")
				.body(format!(
					r#"{{"items":[{{"key":"color","value":"blue"}}],"@nextLink":"{}"}}"#,
					server.url("/kv/next?after=color")
				));
		})
		.await;
	let second = server
		.mock_async(|when, then| {
			when.method(GET).path("/kv/next").header("sync-token", "zAJw6V16");
			then.status(200)
				.header("content-type", "application/json")
				.body(r#"{"items":[{"key":"size","value":"large"}]}"#);
		})
		.await;
	let connection_string =
		format!("Endpoint={};Id=demo-key;Secret=c2VjcmV0LWtleS1ieXRlcw==", server.base_url());
	let client = Client::from_connection_string(&connection_string, ClientOptions::default())?;
	let request = client.request(Method::GET, "/kv?api-version=2023-10-01", &[])?;
	let mut pager = client.pager::<Setting>(request).with_shape(PageShape::new("items", "@nextLink"));

	while pager.more() {
		for setting in pager.next_page().await?.items {
			println!("{} = {}.", setting.key, setting.value);
		}
	}

	println!("Known sync tokens: {:?}.", client.sync_tokens().ids());

	first.assert_async().await;
	second.assert_async().await;

	Ok(())
}
