use std::io::Cursor;

use chrono::{TimeZone, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::config;
use crate::posts::PostListItem;
use crate::text_utils::parse_post_date;

/* Example
<?xml version="1.0" encoding="UTF-8" ?>
<rss version="2.0">

<channel>
  <title>Example blog</title>
  <link>https://blog.example.com</link>
  <description>Posts from the example blog</description>
  <item>
    <title>Caching all the things</title>
    <link>https://blog.example.com/posts/caching-all-the-things</link>
    <description>How this blog answers from SQLite.</description>
  </item>
</channel>

</rss>
*/

pub struct RssChannel<'a> {
    pub feed: &'a config::RssFeed,
    pub posts_dir: &'a str,
}

impl RssChannel<'_> {
    pub fn render(&self, items: &[PostListItem]) -> quick_xml::Result<Vec<u8>> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        // <?xml version="1.0" encoding="UTF-8" ?>
        let decl = Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None));
        writer.write_event(decl)?;

        // <rss version="2.0">
        let mut rss = BytesStart::new("rss");
        rss.push_attribute(("version", "2.0"));
        writer.write_event(Event::Start(rss))?;

        // <channel>
        writer.write_event(Event::Start(BytesStart::new("channel")))?;

        push_text(&mut writer, "title", &self.feed.title)?;
        push_text(&mut writer, "link", &self.feed.site_url)?;
        push_text(&mut writer, "description", &self.feed.description)?;

        for item in items.iter().take(self.feed.page_size as usize) {
            // <item>
            writer.write_event(Event::Start(BytesStart::new("item")))?;

            let title = item.frontmatter.title.as_deref().unwrap_or(&item.slug);
            push_text(&mut writer, "title", title)?;

            let link = post_link(&self.feed.site_url, self.posts_dir, &item.slug);
            push_text(&mut writer, "link", &link)?;

            // <guid isPermaLink="false">caching-all-the-things</guid>
            let mut guid_elem = BytesStart::new("guid");
            guid_elem.push_attribute(("isPermaLink", "false"));
            writer.write_event(Event::Start(guid_elem))?;
            writer.write_event(Event::Text(BytesText::new(&item.slug)))?;
            writer.write_event(Event::End(BytesEnd::new("guid")))?;

            let description = item.frontmatter.description.as_deref().unwrap_or("");
            push_cdata(&mut writer, "description", description)?;

            // <pubDate>Sat, 2 Apr 2022 00:00:00 +0000</pubDate>
            let parsed = item.frontmatter.date.as_deref().and_then(parse_post_date);
            if let Some(date) = parsed {
                let date = Utc.from_utc_datetime(&date);
                push_text(&mut writer, "pubDate", &date.to_rfc2822())?;
            }

            // </item>
            writer.write_event(Event::End(BytesEnd::new("item")))?;
        }

        // </channel>
        writer.write_event(Event::End(BytesEnd::new("channel")))?;
        // </rss>
        writer.write_event(Event::End(BytesEnd::new("rss")))?;

        Ok(writer.into_inner().into_inner())
    }
}

fn post_link(base_url: &str, posts_dir: &str, slug: &str) -> String {
    let base_url = base_url.strip_suffix('/').unwrap_or(base_url);
    format!("{}/{}/{}", base_url, posts_dir, slug)
}

fn push_text(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) -> quick_xml::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn push_cdata(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) -> quick_xml::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    if text.contains("]]>") {
        let new_text = text.replace("]]>", "]] >");
        writer.write_event(Event::CData(BytesCData::new(&new_text)))?;
    } else {
        writer.write_event(Event::CData(BytesCData::new(text)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}
